// Screen capture abstraction layer

pub mod format;
pub mod fbdev;
#[cfg(feature = "drm")]
pub mod drm;
pub mod selector;
#[cfg(test)]
pub(crate) mod testing;

use log::info;
use memmap2::{Mmap, MmapOptions};
use nix::errno::Errno;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub use format::{FormatDescriptor, ScreenGeometry};

/// Default modesetting device node
pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/card0";
/// Default legacy framebuffer device node
pub const DEFAULT_FB_DEVICE: &str = "/dev/fb0";

/// How a capture failure should be handled by whoever drives the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The device could not be opened; the selector may try the next backend
    BackendUnavailable,
    /// Kernel resources were already engaged; the session cannot continue
    StateLost,
}

/// Error types specific to framebuffer capture
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Cannot open capture device '{}': {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("There is no capture backend available")]
    NoBackend,
    #[error("Dropping DRM master failed: {0}")]
    DropMaster(#[source] Errno),
    #[error("No connected display output found")]
    NoConnectedOutput,
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("Framebuffer {fb_id} exposes no buffer handle (insufficient privileges?)")]
    MissingBufferHandle { fb_id: u32 },
    #[error("Unsupported pixel format: 0x{fourcc:08x} ({name})")]
    UnsupportedPixelFormat { fourcc: u32, name: String },
    #[error("Unsupported bit depth: {bits_per_pixel}, only 32 bit mode supported")]
    UnsupportedDepth { bits_per_pixel: u32 },
    #[error("The {channel} channel (offset {offset}, length {length}) does not fit a 32-bit pixel")]
    BadChannelLayout {
        channel: &'static str,
        offset: u32,
        length: u32,
    },
    #[error("Mapping {len} bytes of the frame buffer failed: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Frame layout is invalid: {0}")]
    InvalidFrame(String),
    #[error("Frame is {actual_width}x{actual_height} but the snapshot is {expected_width}x{expected_height}")]
    GeometryMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("The capture backend has been released")]
    Released,
}

impl CaptureError {
    /// Classify this error for the selector and the process supervisor.
    ///
    /// Only a device that could not be opened leaves another backend to try; running out
    /// of backends is as fatal as losing one.
    pub fn class(&self) -> ErrorClass {
        match self {
            CaptureError::DeviceOpen { .. } => ErrorClass::BackendUnavailable,
            _ => ErrorClass::StateLost,
        }
    }

    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> CaptureError {
        move |source| CaptureError::Ioctl { op, source }
    }
}

/// Identifies which kernel interface a backend talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BackendKind {
    Drm,
    Fbdev,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Drm => write!(f, "DRM"),
            BackendKind::Fbdev => write!(f, "FBDEV"),
        }
    }
}

/// Which backends the selector is allowed to probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Modesetting first, then the legacy framebuffer
    #[default]
    Auto,
    Drm,
    Fbdev,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "drm" | "kms" => Ok(BackendPreference::Drm),
            "fbdev" | "fb" => Ok(BackendPreference::Fbdev),
            other => Err(format!("unknown backend '{}', expected auto, drm or fbdev", other)),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Auto => write!(f, "auto"),
            BackendPreference::Drm => write!(f, "drm"),
            BackendPreference::Fbdev => write!(f, "fbdev"),
        }
    }
}

/// Device paths and probing policy handed to the selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub drm_device: PathBuf,
    pub fb_device: PathBuf,
    pub preference: BackendPreference,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            drm_device: PathBuf::from(DEFAULT_DRM_DEVICE),
            fb_device: PathBuf::from(DEFAULT_FB_DEVICE),
            preference: BackendPreference::Auto,
        }
    }
}

/// Read-only view of the most recent frame, borrowed from the backend that maps it
#[derive(Debug, Clone, Copy)]
pub struct FrameHandle<'a> {
    pixels: &'a [u32],
    /// Scanline length in bytes, native to the backend
    stride: u32,
    width: u32,
    height: u32,
}

impl<'a> FrameHandle<'a> {
    /// Wrap 32-bit pixels laid out with `stride` bytes per row
    pub fn new(pixels: &'a [u32], stride: u32, width: u32, height: u32) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidFrame(format!("empty frame {}x{}", width, height)));
        }
        if stride % format::CANONICAL_BYTES_PER_PIXEL != 0 {
            return Err(CaptureError::InvalidFrame(format!(
                "stride {} is not a multiple of the pixel size",
                stride
            )));
        }
        let stride_px = (stride / format::CANONICAL_BYTES_PER_PIXEL) as usize;
        if stride_px < width as usize {
            return Err(CaptureError::InvalidFrame(format!(
                "stride {} is shorter than a {} pixel row",
                stride, width
            )));
        }
        let needed = stride_px * (height as usize - 1) + width as usize;
        if pixels.len() < needed {
            return Err(CaptureError::InvalidFrame(format!(
                "buffer holds {} pixels, {}x{} with stride {} needs {}",
                pixels.len(),
                width,
                height,
                stride,
                needed
            )));
        }
        Ok(Self { pixels, stride, width, height })
    }

    /// Wrap a raw byte mapping described by `geometry`
    pub fn from_bytes(bytes: &'a [u8], geometry: ScreenGeometry) -> Result<Self, CaptureError> {
        let usable = bytes.len() - bytes.len() % 4;
        let pixels: &[u32] = bytemuck::try_cast_slice(&bytes[..usable])
            .map_err(|e| CaptureError::InvalidFrame(format!("unaligned mapping: {}", e)))?;
        Self::new(pixels, geometry.stride, geometry.width, geometry.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn stride_pixels(&self) -> usize {
        (self.stride / format::CANONICAL_BYTES_PER_PIXEL) as usize
    }

    /// Visible pixels of row `y`
    pub fn row(&self, y: u32) -> &'a [u32] {
        let start = y as usize * self.stride_pixels();
        &self.pixels[start..start + self.width as usize]
    }
}

/// The contract both kernel capture paths implement
pub trait CaptureBackend {
    /// Which kernel interface this backend uses
    fn kind(&self) -> BackendKind;

    /// The authoritative format descriptor
    fn format(&self) -> &FormatDescriptor;

    /// Native layout as of the last poll
    fn geometry(&self) -> ScreenGeometry;

    /// Refresh buffer metadata from the kernel
    fn poll(&mut self) -> Result<(), CaptureError>;

    /// Promote the geometry read by `poll` to the authoritative descriptor.
    /// Returns true when it differs from the previous one.
    fn check_resolution_changed(&mut self) -> bool;

    /// View of the current mapping without touching the kernel
    fn frame(&self) -> Result<FrameHandle<'_>, CaptureError>;

    /// Refresh metadata, then return the current frame
    fn read_frame(&mut self) -> Result<FrameHandle<'_>, CaptureError> {
        self.poll()?;
        self.frame()
    }

    /// Unmap and close; safe to call more than once
    fn release(&mut self);
}

/// Authoritative descriptor plus the one most recently read from the kernel
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FormatTracker {
    current: FormatDescriptor,
    latest: FormatDescriptor,
}

impl FormatTracker {
    pub(crate) fn new(format: FormatDescriptor) -> Self {
        Self { current: format, latest: format }
    }

    pub(crate) fn current(&self) -> &FormatDescriptor {
        &self.current
    }

    pub(crate) fn stage(&mut self, format: FormatDescriptor) {
        self.latest = format;
    }

    pub(crate) fn commit(&mut self) -> bool {
        if self.latest == self.current {
            return false;
        }
        if self.latest.same_resolution(&self.current) {
            info!("-- Pixel layout changed at {}x{} --", self.latest.width, self.latest.height);
        } else {
            info!(
                "-- Screen format changed from {}x{} to {}x{} --",
                self.current.width, self.current.height, self.latest.width, self.latest.height
            );
        }
        self.current = self.latest;
        true
    }
}

/// Replace the value in `slot` with the result of `build`, keeping the old one when it fails
pub(crate) fn replace_on_success<T>(
    slot: &mut Option<T>,
    build: impl FnOnce() -> Result<T, CaptureError>,
) -> Result<(), CaptureError> {
    let fresh = build()?;
    *slot = Some(fresh);
    Ok(())
}

/// Map `len` bytes of `file` read-only and shared
pub(crate) fn map_read_only(file: &File, len: usize) -> Result<Mmap, CaptureError> {
    // SAFETY: the mapping is read-only; the kernel may rewrite the pixels underneath us,
    // which only ever yields torn frames, never invalid memory.
    unsafe { MmapOptions::new().len(len).map(file) }.map_err(|source| CaptureError::Map { len, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let open = CaptureError::DeviceOpen {
            path: PathBuf::from("/dev/fb0"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(open.class(), ErrorClass::BackendUnavailable);
        assert_eq!(CaptureError::NoBackend.class(), ErrorClass::StateLost);
        assert_eq!(
            CaptureError::BadChannelLayout { channel: "red", offset: 32, length: 8 }.class(),
            ErrorClass::StateLost
        );
        assert_eq!(CaptureError::NoConnectedOutput.class(), ErrorClass::StateLost);
        assert_eq!(
            CaptureError::Ioctl { op: "MODE_GETCRTC", source: Errno::ENOENT }.class(),
            ErrorClass::StateLost
        );
        assert_eq!(
            CaptureError::UnsupportedDepth { bits_per_pixel: 16 }.class(),
            ErrorClass::StateLost
        );
    }

    #[test]
    fn test_backend_preference_parsing() {
        assert_eq!("auto".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!("DRM".parse::<BackendPreference>().unwrap(), BackendPreference::Drm);
        assert_eq!("fb".parse::<BackendPreference>().unwrap(), BackendPreference::Fbdev);
        assert!("vnc".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn test_frame_handle_rows_use_native_stride() {
        // 3 visible pixels per row, 5 pixels of stride
        let pixels: Vec<u32> = (0..10).collect();
        let frame = FrameHandle::new(&pixels, 20, 3, 2).unwrap();
        assert_eq!(frame.stride_pixels(), 5);
        assert_eq!(frame.row(0), &[0, 1, 2]);
        assert_eq!(frame.row(1), &[5, 6, 7]);
    }

    #[test]
    fn test_frame_handle_rejects_bad_layouts() {
        let pixels = vec![0u32; 8];
        assert!(FrameHandle::new(&pixels, 8, 4, 2).is_err()); // stride shorter than a row
        assert!(FrameHandle::new(&pixels, 18, 4, 2).is_err()); // stride not pixel aligned
        assert!(FrameHandle::new(&pixels, 16, 4, 3).is_err()); // buffer too short
        assert!(FrameHandle::new(&pixels, 16, 0, 2).is_err());
        assert!(FrameHandle::new(&pixels, 16, 4, 2).is_ok());
    }

    #[test]
    fn test_failed_remap_keeps_previous_mapping() {
        let mut slot = Some(vec![1u32, 2, 3]);
        let err = replace_on_success(&mut slot, || {
            Err(CaptureError::Map { len: 4096, source: io::Error::from(io::ErrorKind::OutOfMemory) })
        })
        .unwrap_err();
        assert!(matches!(err, CaptureError::Map { len: 4096, .. }));
        assert_eq!(slot, Some(vec![1, 2, 3]));

        replace_on_success(&mut slot, || Ok(vec![4])).unwrap();
        assert_eq!(slot, Some(vec![4]));
    }

    #[test]
    fn test_format_tracker_commit() {
        let a = FormatDescriptor::new(640, 480, format::ChannelLayout::RGB);
        let b = FormatDescriptor::new(800, 600, format::ChannelLayout::RGB);
        let mut tracker = FormatTracker::new(a);
        assert!(!tracker.commit());
        tracker.stage(b);
        assert_eq!(tracker.current(), &a);
        assert!(tracker.commit());
        assert_eq!(tracker.current(), &b);
        assert!(!tracker.commit());

        // Same resolution, swapped channels: still a change the caller must see
        let c = FormatDescriptor::new(800, 600, format::ChannelLayout::BGR);
        assert!(c.same_resolution(&b));
        tracker.stage(c);
        assert!(tracker.commit());
        assert_eq!(tracker.current(), &c);
    }
}
