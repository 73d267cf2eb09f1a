use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuningError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid tuning file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Timing and threshold knobs for guided capture.
///
/// Every field has a default; a TOML file only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureTuning {
    /// Scanning loop cadence.
    pub scan_interval_ms: u64,
    /// Countdown start value.
    pub countdown_from: u32,
    pub countdown_tick_ms: u64,
    /// Delay before the first monitoring check of a countdown.
    pub monitor_grace_ms: u64,
    pub monitor_interval_ms: u64,
    /// How long the "cancelled" flag stays raised.
    pub cancel_flash_ms: u64,
    /// Threshold passed to the detector itself.
    pub detection_min_confidence: f32,
    /// Quality gate: minimum confidence before a countdown may start.
    pub quality_min_confidence: f32,
    /// Quality gate: minimum face area as a fraction of the frame.
    pub quality_min_area: f64,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Side of the square output still.
    pub output_size: u32,
    pub jpeg_quality: u8,
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            scan_interval_ms: 500,
            countdown_from: 3,
            countdown_tick_ms: 1000,
            monitor_grace_ms: 300,
            monitor_interval_ms: 100,
            cancel_flash_ms: 1500,
            detection_min_confidence: 0.5,
            quality_min_confidence: 0.7,
            quality_min_area: 0.02,
            ideal_width: 1920,
            ideal_height: 1080,
            output_size: 640,
            jpeg_quality: 90,
        }
    }
}

impl CaptureTuning {
    pub fn from_toml_str(src: &str) -> Result<Self, TuningError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self, TuningError> {
        let src = std::fs::read_to_string(path).map_err(|source| TuningError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn monitor_grace(&self) -> Duration {
        Duration::from_millis(self.monitor_grace_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn cancel_flash(&self) -> Duration {
        Duration::from_millis(self.cancel_flash_ms)
    }
}
