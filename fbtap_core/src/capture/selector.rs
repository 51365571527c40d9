use log::{error, info, warn};

use super::fbdev::LegacyFramebufferBackend;
use super::{BackendKind, BackendPreference, CaptureBackend, CaptureConfig, CaptureError, ErrorClass};

/// One attempt at acquiring a backend
pub type Probe = Box<dyn FnOnce() -> Result<Box<dyn CaptureBackend>, CaptureError>>;

/// Tries capture backends in priority order and keeps the first that acquires a mapping
pub struct BackendSelector {
    probes: Vec<(BackendKind, Probe)>,
}

impl BackendSelector {
    /// Selector with no probes registered
    pub fn empty() -> Self {
        Self { probes: Vec::new() }
    }

    /// Standard probe order for `config`: DRM (when built in), then FBDEV
    pub fn from_config(config: &CaptureConfig) -> Self {
        let mut selector = Self::empty();

        #[cfg(feature = "drm")]
        if matches!(config.preference, BackendPreference::Auto | BackendPreference::Drm) {
            let path = config.drm_device.clone();
            selector = selector.with_probe(BackendKind::Drm, move || {
                Ok(Box::new(super::drm::DrmBackend::acquire(path)?) as Box<dyn CaptureBackend>)
            });
        }
        #[cfg(not(feature = "drm"))]
        if config.preference == BackendPreference::Drm {
            warn!(" DRM support was not compiled in; no backend will be probed.");
        }

        if matches!(config.preference, BackendPreference::Auto | BackendPreference::Fbdev) {
            let path = config.fb_device.clone();
            selector = selector.with_probe(BackendKind::Fbdev, move || {
                Ok(Box::new(LegacyFramebufferBackend::acquire(path)?) as Box<dyn CaptureBackend>)
            });
        }

        selector
    }

    /// Append a probe; probes run in the order they were added
    pub fn with_probe<F>(mut self, kind: BackendKind, probe: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn CaptureBackend>, CaptureError> + 'static,
    {
        self.probes.push((kind, Box::new(probe)));
        self
    }

    /// Backends that will be tried, in order
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.probes.iter().map(|(kind, _)| *kind).collect()
    }

    /// Run the probes. An unopenable device moves on to the next probe; any other failure
    /// ends selection immediately.
    pub fn select(self) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        for (kind, probe) in self.probes {
            match probe() {
                Ok(backend) => {
                    info!("-- Using the {} capture backend --", kind);
                    return Ok(backend);
                }
                Err(e) if e.class() == ErrorClass::BackendUnavailable => {
                    warn!(" {} backend unavailable: {}", kind, e);
                }
                Err(e) => {
                    error!(" {} backend failed after the device was opened: {}", kind, e);
                    return Err(e);
                }
            }
        }

        error!(" There is no backend device available.");
        Err(CaptureError::NoBackend)
    }
}

/// Select the active backend for `config`
pub fn select_backend(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    BackendSelector::from_config(config).select()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::ScriptedBackend;
    use std::cell::Cell;
    use std::io;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn unavailable(path: &str) -> CaptureError {
        CaptureError::DeviceOpen {
            path: PathBuf::from(path),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
    }

    #[test]
    fn test_falls_through_unavailable_backend() {
        let backend = BackendSelector::empty()
            .with_probe(BackendKind::Drm, || Err(unavailable("/dev/dri/card0")))
            .with_probe(BackendKind::Fbdev, || {
                Ok(Box::new(ScriptedBackend::solid(BackendKind::Fbdev, 64, 48, 0)) as Box<dyn CaptureBackend>)
            })
            .select()
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Fbdev);
    }

    #[test]
    fn test_first_success_wins() {
        let second_called = Rc::new(Cell::new(false));
        let flag = second_called.clone();
        let backend = BackendSelector::empty()
            .with_probe(BackendKind::Drm, || {
                Ok(Box::new(ScriptedBackend::solid(BackendKind::Drm, 64, 48, 0)) as Box<dyn CaptureBackend>)
            })
            .with_probe(BackendKind::Fbdev, move || {
                flag.set(true);
                Err(unavailable("/dev/fb0"))
            })
            .select()
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Drm);
        assert!(!second_called.get());
    }

    #[test]
    fn test_fatal_error_stops_selection() {
        let second_called = Rc::new(Cell::new(false));
        let flag = second_called.clone();
        let err = BackendSelector::empty()
            .with_probe(BackendKind::Drm, || Err(CaptureError::NoConnectedOutput))
            .with_probe(BackendKind::Fbdev, move || {
                flag.set(true);
                Err(unavailable("/dev/fb0"))
            })
            .select()
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::NoConnectedOutput));
        assert!(!second_called.get());
    }

    #[test]
    fn test_exhausted_probes() {
        let err = BackendSelector::empty()
            .with_probe(BackendKind::Drm, || Err(unavailable("/dev/dri/card0")))
            .with_probe(BackendKind::Fbdev, || Err(unavailable("/dev/fb0")))
            .select()
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::NoBackend));
        assert!(BackendSelector::empty().select().is_err());
    }

    #[test]
    fn test_probe_order_follows_preference() {
        let mut config = CaptureConfig::default();
        #[cfg(feature = "drm")]
        assert_eq!(
            BackendSelector::from_config(&config).kinds(),
            vec![BackendKind::Drm, BackendKind::Fbdev]
        );

        config.preference = BackendPreference::Fbdev;
        assert_eq!(BackendSelector::from_config(&config).kinds(), vec![BackendKind::Fbdev]);

        #[cfg(feature = "drm")]
        {
            config.preference = BackendPreference::Drm;
            assert_eq!(BackendSelector::from_config(&config).kinds(), vec![BackendKind::Drm]);
        }
    }

    #[test]
    fn test_missing_device_nodes() {
        let config = CaptureConfig {
            drm_device: PathBuf::from("/nonexistent/dri/card0"),
            fb_device: PathBuf::from("/nonexistent/fb0"),
            preference: BackendPreference::Auto,
        };
        assert!(matches!(select_backend(&config).err().unwrap(), CaptureError::NoBackend));
    }
}
