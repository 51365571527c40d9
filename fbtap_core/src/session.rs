use log::{debug, info};

use crate::capture::selector::select_backend;
use crate::capture::{BackendKind, CaptureBackend, CaptureConfig, CaptureError, FormatDescriptor, FrameHandle};
use crate::diff::{ChangeDetector, ChangeResult};

/// A selected backend paired with the snapshot that change detection maintains.
///
/// This is what a forwarding layer drives: call [`CaptureSession::poll_and_diff`] at its
/// own cadence and forward the rows of [`CaptureSession::snapshot`] named by each
/// `Changed` result.
pub struct CaptureSession {
    backend: Box<dyn CaptureBackend>,
    detector: ChangeDetector,
}

impl CaptureSession {
    /// Select a backend for `config` and prime the snapshot from its first frame
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        Self::from_backend(select_backend(config)?)
    }

    /// Wrap an already acquired backend
    pub fn from_backend(backend: Box<dyn CaptureBackend>) -> Result<Self, CaptureError> {
        let detector = ChangeDetector::new(backend.format());
        Self::with_detector(backend, detector)
    }

    /// Wrap a backend with a detector using a fixed phase sequence
    pub fn with_seed(backend: Box<dyn CaptureBackend>, seed: u64) -> Result<Self, CaptureError> {
        let detector = ChangeDetector::with_seed(backend.format(), seed);
        Self::with_detector(backend, detector)
    }

    fn with_detector(backend: Box<dyn CaptureBackend>, mut detector: ChangeDetector) -> Result<Self, CaptureError> {
        detector.prime(&backend.frame()?)?;
        info!(
            " {} capture session ready at {}x{}.",
            backend.kind(),
            detector.width(),
            detector.height()
        );
        Ok(Self { backend, detector })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn format(&self) -> &FormatDescriptor {
        self.backend.format()
    }

    /// Refresh metadata and view the live frame
    pub fn read_frame(&mut self) -> Result<FrameHandle<'_>, CaptureError> {
        self.backend.read_frame()
    }

    /// Refresh metadata, then diff the live frame against the snapshot.
    ///
    /// A resolution change reallocates the snapshot, refills it from the new frame and is
    /// reported as a change covering the whole screen.
    pub fn poll_and_diff(&mut self) -> Result<ChangeResult, CaptureError> {
        self.backend.poll()?;

        if self.backend.check_resolution_changed() {
            let format = *self.backend.format();
            self.detector.resize(&format);
            let rect = self.detector.prime(&self.backend.frame()?)?;
            debug!("Snapshot refilled after resize to {}x{}", format.width, format.height);
            return Ok(ChangeResult::Changed(rect));
        }

        let frame = self.backend.frame()?;
        self.detector.detect_and_apply(&frame)
    }

    /// Canonical pixels as of the last `Changed` result, `format().width` per row
    pub fn snapshot(&self) -> &[u32] {
        self.detector.snapshot()
    }

    /// Release the backend. Further polls fail with [`CaptureError::Released`].
    pub fn release(&mut self) {
        self.backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{ScriptedBackend, Step};
    use crate::diff::DirtyRect;

    fn session(backend: ScriptedBackend) -> CaptureSession {
        let _ = env_logger::builder().is_test(true).try_init();
        CaptureSession::with_seed(Box::new(backend), 42).unwrap()
    }

    #[test]
    fn test_open_primes_snapshot() {
        let s = session(ScriptedBackend::solid(BackendKind::Fbdev, 16, 12, 0x0011_2233));
        assert_eq!(s.kind(), BackendKind::Fbdev);
        assert_eq!((s.format().width, s.format().height), (16, 12));
        assert!(s.snapshot().iter().all(|&p| p == 0x0011_2233));
    }

    #[test]
    fn test_quiet_screen_is_idle() {
        let mut s = session(ScriptedBackend::solid(BackendKind::Drm, 1280, 720, 7));
        for _ in 0..50 {
            assert_eq!(s.poll_and_diff().unwrap(), ChangeResult::Idle);
        }
    }

    #[test]
    fn test_painted_band_reaches_snapshot() {
        let backend = ScriptedBackend::solid(BackendKind::Drm, 64, 48, 0)
            .paint(|_, y| if (10..14).contains(&y) { 0x00ff_ffff } else { 0 });
        let mut s = session(backend);

        let rect = s.poll_and_diff().unwrap().rect().unwrap();
        // slip 2 below 540 rows
        assert_eq!(rect, DirtyRect { min_x: 0, min_y: 8, max_x: 63, max_y: 15 });
        assert!(s.snapshot()[10 * 64..14 * 64].iter().all(|&p| p == 0x00ff_ffff));
        assert_eq!(s.poll_and_diff().unwrap(), ChangeResult::Idle);
    }

    #[test]
    fn test_resize_reports_full_screen() {
        let backend = ScriptedBackend::solid(BackendKind::Fbdev, 64, 48, 0).then(Step::Resize {
            width: 80,
            height: 60,
            color: 5,
        });
        let mut s = session(backend);

        let result = s.poll_and_diff().unwrap();
        assert_eq!(result, ChangeResult::Changed(DirtyRect::rows(80, 0, 59)));
        assert_eq!((s.format().width, s.format().height), (80, 60));
        assert_eq!(s.snapshot().len(), 80 * 60);
        assert!(s.snapshot().iter().all(|&p| p == 5));
        assert_eq!(s.poll_and_diff().unwrap(), ChangeResult::Idle);
    }

    #[test]
    fn test_poll_failure_propagates() {
        let backend = ScriptedBackend::solid(BackendKind::Drm, 32, 32, 0).then(Step::Fail(
            CaptureError::Ioctl { op: "MODE_GETCRTC", source: nix::errno::Errno::ENODEV },
        ));
        let mut s = session(backend);
        let err = s.poll_and_diff().unwrap_err();
        assert_eq!(err.class(), crate::capture::ErrorClass::StateLost);
    }

    #[test]
    fn test_read_frame_and_release() {
        let mut s = session(ScriptedBackend::solid(BackendKind::Fbdev, 20, 10, 9));
        {
            let frame = s.read_frame().unwrap();
            assert_eq!((frame.width(), frame.height()), (20, 10));
            assert!(frame.stride_pixels() > 20);
            assert_eq!(frame.row(9), &[9; 20][..]);
        }
        s.release();
        assert!(matches!(s.poll_and_diff().unwrap_err(), CaptureError::Released));
        assert!(matches!(s.read_frame().unwrap_err(), CaptureError::Released));
    }
}
