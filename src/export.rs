use anyhow::{anyhow, Context, Result};
use fbtap_core::FormatDescriptor;
use image::{ImageFormat, Rgba, RgbaImage};
use std::path::Path;

/// Convert canonical snapshot pixels to an opaque RGBA image using the channel layout
pub fn snapshot_to_image(snapshot: &[u32], format: &FormatDescriptor) -> Result<RgbaImage> {
    if snapshot.len() != format.pixel_count() {
        return Err(anyhow!(
            "Snapshot holds {} pixels, expected {} for {}x{}",
            snapshot.len(),
            format.pixel_count(),
            format.width,
            format.height
        ));
    }

    let width = format.width as usize;
    Ok(RgbaImage::from_fn(format.width, format.height, |x, y| {
        let [r, g, b] = format.to_rgb8(snapshot[y as usize * width + x as usize]);
        Rgba([r, g, b, 0xff])
    }))
}

/// Write the snapshot to `path` as PNG
pub fn save_png(path: &Path, snapshot: &[u32], format: &FormatDescriptor) -> Result<()> {
    snapshot_to_image(snapshot, format)?
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to save snapshot to {}", path.display()))
}
