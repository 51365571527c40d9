use anyhow::{anyhow, Context, Result};
use fbtap_core::capture::{DEFAULT_DRM_DEVICE, DEFAULT_FB_DEVICE};
use fbtap_core::{BackendPreference, CaptureConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default delay between two polls of the watch loop
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Persistent settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Modesetting device node
    pub drm_device: PathBuf,
    /// Legacy framebuffer device node
    pub fb_device: PathBuf,
    /// auto, drm or fbdev
    pub backend: String,
    pub poll_interval_ms: u64,
    /// Write logs here instead of stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drm_device: PathBuf::from(DEFAULT_DRM_DEVICE),
            fb_device: PathBuf::from(DEFAULT_FB_DEVICE),
            backend: BackendPreference::Auto.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Get settings file path
    pub fn get_settings_file() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join("fbtap").join("settings.json"))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_settings_file()?)
    }

    /// Load settings from `path`, writing the defaults there if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            let settings = serde_json::from_str(&json)
                .with_context(|| format!("Invalid settings file {}", path.display()))?;
            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save_to(path)?;
            Ok(settings)
        }
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    pub fn preference(&self) -> Result<BackendPreference> {
        self.backend.parse::<BackendPreference>().map_err(|e| anyhow!(e))
    }

    /// What the capture library needs from these settings
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        Ok(CaptureConfig {
            drm_device: self.drm_device.clone(),
            fb_device: self.fb_device.clone(),
            preference: self.preference()?,
        })
    }
}
