use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use facelens_core::detection::domain::inference_adapter::InferenceOptions;
use facelens_core::overlay::domain::display_surface::OverlayStyle;
use facelens_core::shared::constants::{DEFAULT_CADENCE, DEFAULT_READY_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cadence_ms: u64,
    pub ready_timeout_ms: u64,
    pub skip_unchanged: bool,
    pub font: Option<PathBuf>,
    /// ffmpeg input format for live devices, e.g. `v4l2`.
    pub input_format: Option<String>,
    pub inference: InferenceOptions,
    pub overlay: OverlayStyle,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cadence_ms: DEFAULT_CADENCE.as_millis() as u64,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
            skip_unchanged: false,
            font: None,
            input_format: None,
            inference: InferenceOptions::default(),
            overlay: OverlayStyle::default(),
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("FaceLens").join("settings.json"))
    }

    /// Reads the user config file, falling back to defaults when it is
    /// missing or invalid.
    pub fn load() -> Self {
        Self::config_path()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("Ignoring invalid settings file: {e}");
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Reads an explicitly requested config file. Unlike [`Settings::load`],
    /// a missing or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config {}: {e}", path.display()))?;
        let settings = serde_json::from_str(&json)
            .map_err(|e| format!("Invalid config {}: {e}", path.display()))?;
        Ok(settings)
    }
}
