use lensfit_capture::{CaptureTuning, TuningError};
use lensfit_core::DisplaySize;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD model file.
    pub model_dir: PathBuf,
    /// Base URL of the face analysis service.
    pub api_base_url: String,
    /// Rendered preview size, if it differs from the native camera size.
    pub display: Option<DisplaySize>,
    /// Optional TOML file overriding capture timings and thresholds.
    pub tuning_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `LENSFIT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("LENSFIT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        Self {
            camera_device: std::env::var("LENSFIT_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            api_base_url: std::env::var("LENSFIT_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            display: parse_display(
                std::env::var("LENSFIT_DISPLAY_WIDTH").ok().as_deref(),
                std::env::var("LENSFIT_DISPLAY_HEIGHT").ok().as_deref(),
            ),
            tuning_path: std::env::var("LENSFIT_TUNING").ok().map(PathBuf::from),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_500m.onnx")
    }

    /// Capture tuning from `LENSFIT_TUNING`, or the built-in defaults.
    pub fn load_tuning(&self) -> Result<CaptureTuning, TuningError> {
        match &self.tuning_path {
            Some(path) => CaptureTuning::load(path),
            None => Ok(CaptureTuning::default()),
        }
    }
}

/// `$XDG_DATA_HOME/lensfit/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("lensfit/models")
}

/// Both dimensions must be present and positive; otherwise the preview is
/// assumed to match the camera.
fn parse_display(width: Option<&str>, height: Option<&str>) -> Option<DisplaySize> {
    let width: f32 = width?.trim().parse().ok()?;
    let height: f32 = height?.trim().parse().ok()?;
    (width > 0.0 && height > 0.0).then(|| DisplaySize::new(width, height))
}
