use kms_sys::{
    drm_gem_close, drm_ioctl_drop_master, drm_ioctl_gem_close, drm_ioctl_mode_getconnector,
    drm_ioctl_mode_getcrtc, drm_ioctl_mode_getencoder, drm_ioctl_mode_getfb2,
    drm_ioctl_mode_getresources, drm_ioctl_prime_handle_to_fd, drm_mode_card_res, drm_mode_crtc,
    drm_mode_fb_cmd2, drm_mode_get_connector, drm_mode_get_encoder, drm_prime_handle, fourcc_name,
    DRM_CLOEXEC, DRM_MODE_CONNECTED, DRM_RDWR,
};
use log::{debug, info, warn};
use memmap2::Mmap;
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use super::format::{FormatDescriptor, ScreenGeometry};
use super::{map_read_only, BackendKind, CaptureBackend, CaptureError, FormatTracker, FrameHandle};

/// Upper bound on GETRESOURCES retries while connectors are being hotplugged
const RESOURCE_RETRIES: usize = 4;

/// Capture through the modesetting interface (`/dev/dri/cardN`).
///
/// The CRTC driving the first connected output is picked once at acquisition. The buffer it
/// scans out is exported as a dma-buf and mapped read-only; whenever the CRTC starts
/// scanning a different buffer (page flip, mode set) the new one is exported and mapped
/// in its place.
#[derive(Debug)]
pub struct DrmBackend {
    path: PathBuf,
    device: Option<File>,
    crtc_id: u32,
    /// Framebuffer id the mapping belongs to
    buffer_id: u32,
    fourcc: u32,
    mapping: Option<Mmap>,
    /// Byte offset of plane 0 inside the mapping
    plane_offset: usize,
    geometry: ScreenGeometry,
    format: FormatTracker,
}

/// A mapped scanout buffer together with its description
struct MappedBuffer {
    mapping: Mmap,
    plane_offset: usize,
    geometry: ScreenGeometry,
    format: FormatDescriptor,
}

impl DrmBackend {
    /// Open the DRM device and map the buffer scanned out by the first connected output.
    ///
    /// Only a failure to open the node is recoverable; anything later is fatal.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        info!("-- Initializing DRM framebuffer device --");

        let device = File::open(&path).map_err(|source| CaptureError::DeviceOpen {
            path: path.clone(),
            source,
        })?;
        info!(" The DRM framebuffer device '{}' has been attached.", path.display());

        drop_master(&device)?;

        let crtc_id = find_active_crtc(&device)?;
        let crtc = get_crtc(&device, crtc_id)?;
        let fb = get_fb2(&device, crtc.fb_id)?;
        let buffer = map_buffer(&device, &fb)?;

        info!(
            " Screen width: {} px, height: {} px.",
            buffer.geometry.width, buffer.geometry.height
        );
        info!(
            " Stride: {} bytes, FourCC format: {}.",
            buffer.geometry.stride,
            fourcc_name(fb.pixel_format)
        );

        Ok(Self {
            path,
            device: Some(device),
            crtc_id,
            buffer_id: fb.fb_id,
            fourcc: fb.pixel_format,
            mapping: Some(buffer.mapping),
            plane_offset: buffer.plane_offset,
            geometry: buffer.geometry,
            format: FormatTracker::new(buffer.format),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// CRTC selected at acquisition
    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }

    /// Framebuffer currently mapped
    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    /// FourCC of the framebuffer currently mapped
    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }
}

/// Give up DRM master if we happen to hold it; capture never needs it
fn drop_master(device: &File) -> Result<(), CaptureError> {
    // SAFETY: `device` is an open DRM node; DROP_MASTER takes no argument.
    match unsafe { drm_ioctl_drop_master(device.as_raw_fd()) } {
        Ok(_) => info!(" DRM master dropped successfully."),
        Err(Errno::EPERM) | Err(Errno::EINVAL) => {
            info!(" DRM master not owned, drop not required.")
        }
        Err(e) => return Err(CaptureError::DropMaster(e)),
    }
    Ok(())
}

/// Connector ids reported by GETRESOURCES
fn connector_ids(device: &File) -> Result<Vec<u32>, CaptureError> {
    let fd = device.as_raw_fd();
    for _ in 0..RESOURCE_RETRIES {
        let mut res = drm_mode_card_res::default();
        // SAFETY: all array pointers are null with zero counts, so only counts are written.
        unsafe { drm_ioctl_mode_getresources(fd, &mut res) }
            .map_err(CaptureError::ioctl("MODE_GETRESOURCES"))?;

        let count = res.count_connectors;
        let mut ids = vec![0u32; count as usize];
        let mut res = drm_mode_card_res {
            connector_id_ptr: ids.as_mut_ptr() as u64,
            count_connectors: count,
            ..Default::default()
        };
        // SAFETY: `ids` holds exactly `count_connectors` entries and outlives the call.
        unsafe { drm_ioctl_mode_getresources(fd, &mut res) }
            .map_err(CaptureError::ioctl("MODE_GETRESOURCES"))?;

        // A connector appeared between the two calls; nothing was copied, ask again
        if res.count_connectors <= count {
            ids.truncate(res.count_connectors as usize);
            return Ok(ids);
        }
        debug!(" Connector count changed during enumeration, retrying.");
    }
    Err(CaptureError::Ioctl {
        op: "MODE_GETRESOURCES",
        source: Errno::EAGAIN,
    })
}

fn get_connector(device: &File, connector_id: u32) -> Result<drm_mode_get_connector, Errno> {
    let mut conn = drm_mode_get_connector {
        connector_id,
        ..Default::default()
    };
    // SAFETY: every array pointer is null with a zero count.
    unsafe { drm_ioctl_mode_getconnector(device.as_raw_fd(), &mut conn) }?;
    Ok(conn)
}

fn get_encoder(device: &File, encoder_id: u32) -> Result<drm_mode_get_encoder, CaptureError> {
    let mut enc = drm_mode_get_encoder {
        encoder_id,
        ..Default::default()
    };
    // SAFETY: plain in/out struct, no embedded pointers.
    unsafe { drm_ioctl_mode_getencoder(device.as_raw_fd(), &mut enc) }
        .map_err(CaptureError::ioctl("MODE_GETENCODER"))?;
    Ok(enc)
}

fn get_crtc(device: &File, crtc_id: u32) -> Result<drm_mode_crtc, CaptureError> {
    let mut crtc = drm_mode_crtc {
        crtc_id,
        ..Default::default()
    };
    // SAFETY: `set_connectors_ptr` is null with a zero count.
    unsafe { drm_ioctl_mode_getcrtc(device.as_raw_fd(), &mut crtc) }
        .map_err(CaptureError::ioctl("MODE_GETCRTC"))?;
    Ok(crtc)
}

fn get_fb2(device: &File, fb_id: u32) -> Result<drm_mode_fb_cmd2, CaptureError> {
    let mut fb = drm_mode_fb_cmd2 {
        fb_id,
        ..Default::default()
    };
    // SAFETY: plain in/out struct, no embedded pointers.
    unsafe { drm_ioctl_mode_getfb2(device.as_raw_fd(), &mut fb) }
        .map_err(CaptureError::ioctl("MODE_GETFB2"))?;
    Ok(fb)
}

/// Resolve connector -> encoder -> CRTC for the first connected output
fn find_active_crtc(device: &File) -> Result<u32, CaptureError> {
    let connector = connector_ids(device)?
        .into_iter()
        .filter_map(|id| match get_connector(device, id) {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(" Skipping connector {}: {}", id, e);
                None
            }
        })
        .find(|conn| conn.connection == DRM_MODE_CONNECTED)
        .ok_or(CaptureError::NoConnectedOutput)?;

    let encoder = get_encoder(device, connector.encoder_id)?;
    debug!(
        " Connector {} -> encoder {} -> CRTC {}.",
        connector.connector_id, encoder.encoder_id, encoder.crtc_id
    );
    Ok(encoder.crtc_id)
}

/// Geometry and canonical format of a GETFB2 reply
fn describe(fb: &drm_mode_fb_cmd2) -> Result<(ScreenGeometry, FormatDescriptor), CaptureError> {
    let format = FormatDescriptor::from_fourcc(fb.width, fb.height, fb.pixel_format)?;
    let geometry = ScreenGeometry {
        width: fb.width,
        height: fb.height,
        stride: fb.pitches[0],
    };
    Ok((geometry, format))
}

/// Distinct non-zero GEM handles referenced by a framebuffer's planes
fn unique_handles(fb: &drm_mode_fb_cmd2) -> Vec<u32> {
    let mut handles: Vec<u32> = fb.handles.iter().copied().filter(|&h| h != 0).collect();
    handles.sort_unstable();
    handles.dedup();
    handles
}

/// GETFB2 hands out fresh GEM handles on every call; give them back
fn close_handles(device: &File, fb: &drm_mode_fb_cmd2) {
    for handle in unique_handles(fb) {
        let arg = drm_gem_close { handle, pad: 0 };
        // SAFETY: `handle` was returned by GETFB2 on this descriptor.
        if let Err(e) = unsafe { drm_ioctl_gem_close(device.as_raw_fd(), &arg) } {
            warn!(" GEM_CLOSE failed (handle={}): {}", handle, e);
        }
    }
}

/// Export plane 0 of `fb` as a dma-buf and map it read-only
fn map_buffer(device: &File, fb: &drm_mode_fb_cmd2) -> Result<MappedBuffer, CaptureError> {
    let result = export_and_map(device, fb);
    close_handles(device, fb);
    result
}

fn export_and_map(device: &File, fb: &drm_mode_fb_cmd2) -> Result<MappedBuffer, CaptureError> {
    let (geometry, format) = describe(fb)?;
    if fb.handles[0] == 0 {
        return Err(CaptureError::MissingBufferHandle { fb_id: fb.fb_id });
    }

    let mut prime = drm_prime_handle {
        handle: fb.handles[0],
        flags: DRM_CLOEXEC | DRM_RDWR,
        fd: -1,
    };
    // SAFETY: plain in/out struct; on success the kernel hands us a new descriptor.
    unsafe { drm_ioctl_prime_handle_to_fd(device.as_raw_fd(), &mut prime) }
        .map_err(CaptureError::ioctl("PRIME_HANDLE_TO_FD"))?;
    // SAFETY: `prime.fd` is a freshly created descriptor nobody else owns.
    let dmabuf = File::from(unsafe { OwnedFd::from_raw_fd(prime.fd) });

    let plane_offset = fb.offsets[0] as usize;
    let mapping = map_read_only(&dmabuf, plane_offset + geometry.mapped_len())?;
    // `dmabuf` closes here; the mapping keeps the buffer alive

    Ok(MappedBuffer {
        mapping,
        plane_offset,
        geometry,
        format,
    })
}

impl CaptureBackend for DrmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Drm
    }

    fn format(&self) -> &FormatDescriptor {
        self.format.current()
    }

    fn geometry(&self) -> ScreenGeometry {
        self.geometry
    }

    fn poll(&mut self) -> Result<(), CaptureError> {
        let device = self.device.as_ref().ok_or(CaptureError::Released)?;
        let crtc = get_crtc(device, self.crtc_id)?;
        if crtc.fb_id == self.buffer_id {
            return Ok(());
        }

        debug!(
            " CRTC {} switched from buffer {} to {}.",
            self.crtc_id, self.buffer_id, crtc.fb_id
        );
        let fb = get_fb2(device, crtc.fb_id)?;
        // The old view stays usable if the new buffer cannot be mapped
        let buffer = map_buffer(device, &fb)?;

        self.buffer_id = fb.fb_id;
        self.fourcc = fb.pixel_format;
        self.mapping = Some(buffer.mapping);
        self.plane_offset = buffer.plane_offset;
        self.geometry = buffer.geometry;
        self.format.stage(buffer.format);
        Ok(())
    }

    fn check_resolution_changed(&mut self) -> bool {
        self.format.commit()
    }

    fn frame(&self) -> Result<FrameHandle<'_>, CaptureError> {
        let mapping = self.mapping.as_ref().ok_or(CaptureError::Released)?;
        FrameHandle::from_bytes(&mapping[self.plane_offset..], self.geometry)
    }

    fn release(&mut self) {
        let had_mapping = self.mapping.take().is_some();
        let had_device = self.device.take().is_some();
        if had_mapping || had_device {
            info!(" DRM device detached.");
        }
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        self.release();
    }
}
