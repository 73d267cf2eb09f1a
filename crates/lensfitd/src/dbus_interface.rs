use crate::engine::{DaemonEngine, EngineError};
use lensfit_core::DisplaySize;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.lensfit.Capture1";
pub const OBJECT_PATH: &str = "/org/lensfit/Capture1";

/// D-Bus interface for the Lensfit capture daemon.
///
/// Bus name: org.lensfit.Capture1
/// Object path: /org/lensfit/Capture1
pub struct CaptureService {
    engine: DaemonEngine,
}

impl CaptureService {
    pub fn new(engine: DaemonEngine) -> Self {
        Self { engine }
    }
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.lensfit.Capture1")]
impl CaptureService {
    /// Open the camera and begin guided auto-capture.
    async fn start_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_camera requested");
        self.engine.start().await.map_err(failed)
    }

    /// Stop auto-capture and release the camera.
    async fn stop_camera(&self) {
        tracing::info!("stop_camera requested");
        self.engine.session().stop_camera();
    }

    /// Discard the captured photo and start scanning again.
    async fn retake(&self) -> zbus::fdo::Result<()> {
        tracing::info!("retake requested");
        self.engine.retake().await.map_err(failed)
    }

    async fn reset(&self) {
        tracing::info!("reset requested");
        self.engine.session().reset().await;
    }

    /// Capture immediately, skipping the countdown.
    async fn capture_now(&self) -> zbus::fdo::Result<()> {
        tracing::info!("capture_now requested");
        self.engine.capture_now().map_err(failed)
    }

    /// Report the rendered preview size so the guide region tracks it.
    async fn set_display_size(&self, width: f64, height: f64) -> zbus::fdo::Result<()> {
        if !(width > 0.0 && height > 0.0) {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "display size must be positive, got {width}x{height}"
            )));
        }
        self.engine
            .session()
            .set_display_size(DisplaySize::new(width as f32, height as f32));
        Ok(())
    }

    /// Return the session snapshot as JSON.
    async fn status(&self) -> String {
        self.engine.status_json()
    }

    /// Return the captured JPEG.
    async fn captured_image(&self) -> zbus::fdo::Result<Vec<u8>> {
        self.engine.captured_jpeg().map_err(failed)
    }

    /// Submit the captured photo for analysis and wait for the result (JSON).
    async fn analyze(&self) -> zbus::fdo::Result<String> {
        tracing::info!("analyze requested");
        let outcome = self.engine.analyze().await.map_err(failed)?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Emitted with the JSON snapshot whenever session state changes.
    #[zbus(signal)]
    pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;
}
