use kms_sys::{fb_var_screeninfo, fbioget_vscreeninfo};
use log::{debug, info};
use memmap2::Mmap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use super::format::{FormatDescriptor, ScreenGeometry};
use super::{map_read_only, replace_on_success, BackendKind, CaptureBackend, CaptureError, FormatTracker, FrameHandle};

/// Capture through the legacy linear framebuffer (`/dev/fbN`)
#[derive(Debug)]
pub struct LegacyFramebufferBackend {
    /// Device node this backend was acquired from
    path: PathBuf,
    /// Open device; `None` once released
    device: Option<File>,
    /// Read-only view of the framebuffer memory
    mapping: Option<Mmap>,
    /// Variable screen info as of the last query
    var_info: fb_var_screeninfo,
    geometry: ScreenGeometry,
    format: FormatTracker,
}

impl LegacyFramebufferBackend {
    /// Open and map the framebuffer device.
    ///
    /// Failing to open the node is reported as [`CaptureError::DeviceOpen`] so the selector
    /// can move on; everything after that is fatal for the session.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        info!("-- Initializing FBDEV framebuffer device --");

        let device = File::open(&path).map_err(|source| CaptureError::DeviceOpen {
            path: path.clone(),
            source,
        })?;
        info!(" The FBDEV framebuffer device '{}' has been attached.", path.display());

        let var_info = query_var_info(&device)?;
        let format = FormatDescriptor::from_var_info(&var_info)?;
        let geometry = geometry_of(&var_info);

        debug!(
            " Virtual width: {}, virtual height: {}.",
            var_info.xres_virtual, var_info.yres_virtual
        );
        debug!(" X axis offset: {}, Y axis offset: {}.", var_info.xoffset, var_info.yoffset);
        info!(
            " Screen {}x{}, stride: {} bytes, framebuffer size: {} bytes.",
            geometry.width,
            geometry.height,
            geometry.stride,
            geometry.mapped_len()
        );

        let mapping = map_read_only(&device, geometry.mapped_len())?;

        Ok(Self {
            path,
            device: Some(device),
            mapping: Some(mapping),
            var_info,
            geometry,
            format: FormatTracker::new(format),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Variable screen info as of the last poll
    pub fn var_info(&self) -> &fb_var_screeninfo {
        &self.var_info
    }
}

/// Visible geometry described by the variable screen info
fn geometry_of(info: &fb_var_screeninfo) -> ScreenGeometry {
    ScreenGeometry {
        width: info.xres,
        height: info.yres,
        stride: info.xres_virtual * (info.bits_per_pixel / 8),
    }
}

fn query_var_info(device: &File) -> Result<fb_var_screeninfo, CaptureError> {
    let mut info = fb_var_screeninfo::default();
    // SAFETY: `device` is an open fbdev node and `info` is a correctly sized out-parameter.
    unsafe { fbioget_vscreeninfo(device.as_raw_fd(), &mut info) }
        .map_err(CaptureError::ioctl("FBIOGET_VSCREENINFO"))?;
    Ok(info)
}

impl CaptureBackend for LegacyFramebufferBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fbdev
    }

    fn format(&self) -> &FormatDescriptor {
        self.format.current()
    }

    fn geometry(&self) -> ScreenGeometry {
        self.geometry
    }

    fn poll(&mut self) -> Result<(), CaptureError> {
        let device = self.device.as_ref().ok_or(CaptureError::Released)?;
        let info = query_var_info(device)?;
        if info == self.var_info {
            return Ok(());
        }

        let format = FormatDescriptor::from_var_info(&info)?;
        let geometry = geometry_of(&info);
        let mapped = self.mapping.as_ref().map_or(0, |m| m.len());
        if geometry.mapped_len() > mapped {
            debug!(
                " Remapping framebuffer: {} bytes needed, {} mapped.",
                geometry.mapped_len(),
                mapped
            );
            replace_on_success(&mut self.mapping, || map_read_only(device, geometry.mapped_len()))?;
        }

        self.var_info = info;
        self.geometry = geometry;
        self.format.stage(format);
        Ok(())
    }

    fn check_resolution_changed(&mut self) -> bool {
        self.format.commit()
    }

    fn frame(&self) -> Result<FrameHandle<'_>, CaptureError> {
        let mapping = self.mapping.as_ref().ok_or(CaptureError::Released)?;
        FrameHandle::from_bytes(&mapping[..], self.geometry)
    }

    fn release(&mut self) {
        let had_mapping = self.mapping.take().is_some();
        let had_device = self.device.take().is_some();
        if had_mapping || had_device {
            info!(" The FBDEV framebuffer device has been detached.");
        }
    }
}

impl Drop for LegacyFramebufferBackend {
    fn drop(&mut self) {
        self.release();
    }
}
