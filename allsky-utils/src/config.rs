//! Monitor configuration shared across the allsky workspace.
//!
//! [`MonitorSettings`] is the single typed source of truth for every tunable:
//! camera connection details, preprocessing geometry, safety allow-list, and
//! scheduling. It serializes to JSON so operators can edit it on disk; the
//! monitor loop only ever sees an immutable snapshot per cycle.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Center-crop geometry applied before the resize step.
///
/// A width or height of zero means "skip the crop"; [`MonitorSettings::effective_crop`]
/// normalizes that case to `None`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CropDimensions {
    pub width: u32,
    pub height: u32,
}

impl CropDimensions {
    /// Creates a new `CropDimensions`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Model input resolution in pixels (width x height).
///
/// Must match the resolution the classifier was trained at; the classifier
/// rejects a model whose declared input shape disagrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputDimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for InputDimensions {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
        }
    }
}

/// Persistent monitor settings consumed by the daemon and the prep tool.
///
/// All fields have defaults so a partial JSON file is still usable. A reload
/// produces a fresh value; running cycles keep the snapshot they started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    /// Hostname or IP of the allsky camera.
    pub host: String,
    /// SSH port on the camera.
    pub port: u16,
    /// SFTP username.
    pub username: String,
    /// SFTP password.
    pub password: String,
    /// Path of the latest image on the camera.
    pub remote_image_path: String,
    /// Local path the fetched image is written to.
    pub local_image_path: PathBuf,
    /// Optional center crop applied before resizing. `None` (or a zero
    /// dimension) skips the crop.
    pub crop: Option<CropDimensions>,
    /// Model input resolution.
    pub input: InputDimensions,
    /// Comma-delimited list of sky conditions considered safe to operate under.
    pub safe_conditions: String,
    /// Seconds between monitoring cycles.
    pub poll_interval_secs: u64,
    /// Maximum SFTP attempts per cycle.
    pub max_retries: u32,
    /// Seconds to wait between SFTP attempts.
    pub retry_delay_secs: u64,
    /// Path of the status file the observatory control system polls.
    pub status_file_path: PathBuf,
    /// Path to the ONNX classifier model.
    pub model_path: PathBuf,
    /// Path to the ordered label list (one label per line).
    pub labels_path: PathBuf,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 22,
            username: "pi".to_string(),
            password: "raspberry".to_string(),
            remote_image_path: "/home/pi/allsky/images/latest.jpg".to_string(),
            local_image_path: PathBuf::from("images/latest.jpg"),
            crop: Some(CropDimensions::new(1300, 1300)),
            input: InputDimensions::default(),
            safe_conditions: "Clear,Partially Clear,Clear with Moon".to_string(),
            poll_interval_secs: 30,
            max_retries: 3,
            retry_delay_secs: 5,
            status_file_path: PathBuf::from("status/ASCOM_STATUS.txt"),
            model_path: PathBuf::from("models/allsky_cloud_detector.onnx"),
            labels_path: PathBuf::from("models/labels.txt"),
        }
    }
}

impl MonitorSettings {
    /// Load settings from a JSON file.
    ///
    /// Missing fields fall back to their defaults; the result is validated
    /// before being returned so type and range errors surface at load time
    /// rather than mid-cycle.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: MonitorSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON.
    ///
    /// This will overwrite the file if it already exists.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create settings directory {}", parent.display())
            })?;
        }
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Range-check the numeric fields.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.input.width > 0 && self.input.height > 0,
            "input dimensions must be greater than zero (got {}x{})",
            self.input.width,
            self.input.height
        );
        if let Some(crop) = self.crop {
            // A zero pair means "skip crop"; one zero and one positive is a typo.
            anyhow::ensure!(
                (crop.width > 0) == (crop.height > 0),
                "crop dimensions must both be positive or both be zero (got {}x{})",
                crop.width,
                crop.height
            );
        }
        anyhow::ensure!(self.max_retries >= 1, "max_retries must be at least 1");
        anyhow::ensure!(
            self.poll_interval_secs >= 1,
            "poll_interval_secs must be at least 1"
        );
        anyhow::ensure!(!self.host.trim().is_empty(), "host must not be empty");
        Ok(())
    }

    /// The crop to apply, with the "zero means skip" convention resolved.
    pub fn effective_crop(&self) -> Option<CropDimensions> {
        self.crop.filter(|c| c.width > 0 && c.height > 0)
    }

    /// Time to sleep between cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Time to sleep between fetch attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Returns the default path for persisted monitor settings
/// (`config/monitor_settings.json`).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/monitor_settings.json"))
        .unwrap_or_else(|_| PathBuf::from("config/monitor_settings.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = MonitorSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = MonitorSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "host": "10.0.0.7",
            "poll_interval_secs": 60
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = MonitorSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.host, "10.0.0.7");
        assert_eq!(loaded.poll_interval_secs, 60);
        assert_eq!(loaded.port, 22);
        assert_eq!(loaded.input, InputDimensions::default());
    }

    #[test]
    fn zero_crop_pair_means_skip() {
        let settings = MonitorSettings {
            crop: Some(CropDimensions::new(0, 0)),
            ..MonitorSettings::default()
        };
        settings.validate().expect("zero pair is valid");
        assert_eq!(settings.effective_crop(), None);
    }

    #[test]
    fn mixed_zero_crop_is_rejected() {
        let settings = MonitorSettings {
            crop: Some(CropDimensions::new(1300, 0)),
            ..MonitorSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_input_is_rejected() {
        let settings = MonitorSettings {
            input: InputDimensions {
                width: 0,
                height: 224,
            },
            ..MonitorSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
