use lensfit_capture::{
    AnalysisApi, AnalysisClient, AnalysisError, AnalysisOutcome, CaptureError, CaptureSession,
    HttpAnalysisApi, SessionSnapshot, TuningError,
};
use lensfit_core::{FaceModel, ScrfdModel};
use lensfit_hw::{CameraSource, V4l2Camera};
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("tuning error: {0}")]
    Tuning(#[from] TuningError),
    #[error("no captured image; take a photo first")]
    NoCapturedImage,
    #[error("an analysis is already running")]
    AnalysisInProgress,
}

/// The engine as the daemon runs it.
pub type DaemonEngine = Engine<V4l2Camera, ScrfdModel, HttpAnalysisApi>;

/// Clone-safe handle pairing the capture session with the analysis client.
pub struct Engine<C, M, A> {
    session: CaptureSession<C, M>,
    analysis: Arc<AnalysisClient<A>>,
    /// Held for the duration of a submission.
    analyzing: Arc<tokio::sync::Mutex<()>>,
}

impl<C, M, A> Clone for Engine<C, M, A> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            analysis: Arc::clone(&self.analysis),
            analyzing: Arc::clone(&self.analyzing),
        }
    }
}

impl<C: CameraSource, M: FaceModel, A: AnalysisApi> Engine<C, M, A> {
    pub fn new(session: CaptureSession<C, M>, analysis: AnalysisClient<A>) -> Self {
        Self {
            session,
            analysis: Arc::new(analysis),
            analyzing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn session(&self) -> &CaptureSession<C, M> {
        &self.session
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        Ok(self.session.start_camera().await?)
    }

    pub async fn retake(&self) -> Result<(), EngineError> {
        Ok(self.session.retake().await?)
    }

    pub fn capture_now(&self) -> Result<(), EngineError> {
        Ok(self.session.capture_now()?)
    }

    pub fn captured_jpeg(&self) -> Result<Vec<u8>, EngineError> {
        self.session
            .captured_image()
            .map(|image| image.jpeg.clone())
            .ok_or(EngineError::NoCapturedImage)
    }

    /// Submit the captured photo once. A second request while one is in
    /// flight is refused rather than queued.
    pub async fn analyze(&self) -> Result<AnalysisOutcome, EngineError> {
        let jpeg = self.captured_jpeg()?;
        let _running = self
            .analyzing
            .try_lock()
            .map_err(|_| EngineError::AnalysisInProgress)?;
        Ok(self.analysis.analyze(jpeg).await?)
    }

    pub fn status_json(&self) -> String {
        state_json(&self.session.snapshot())
    }
}

pub fn state_json(snapshot: &SessionSnapshot) -> String {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "state": snapshot,
    })
    .to_string()
}

/// Build the daemon's engine from configuration.
///
/// The camera is not opened here; it is acquired on `StartCamera`. A
/// missing model file is logged but not fatal, since capture still works
/// without detection through `CaptureNow`.
pub fn build(config: &Config) -> Result<DaemonEngine, EngineError> {
    let tuning = config.load_tuning()?;
    tracing::info!(
        scan_interval_ms = tuning.scan_interval_ms,
        countdown_from = tuning.countdown_from,
        output_size = tuning.output_size,
        "capture tuning loaded"
    );

    let model_path = config.scrfd_model_path();
    if !model_path.exists() {
        tracing::warn!(
            path = %model_path.display(),
            "SCRFD model not found; auto-capture will not detect faces"
        );
    }

    let camera = V4l2Camera::new(config.camera_device.clone());
    let model = ScrfdModel::new(model_path);
    let session = CaptureSession::new(camera, model, tuning);
    if let Some(display) = config.display {
        session.set_display_size(display);
    }

    let api = HttpAnalysisApi::new(&config.api_base_url)?;
    tracing::info!(
        device = %config.camera_device,
        api = api.base_url(),
        "engine ready"
    );

    Ok(Engine::new(session, AnalysisClient::new(api)))
}
