//! Detector adapter: lazy model load, throttled detection, result cache.

use crate::detector::{DetectorError, FaceModel};
use crate::governor::{PerformanceGovernor, PerformanceMode};
use crate::types::DetectionResult;
use image::RgbImage;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loaded,
    Failed,
}

/// Wraps a [`FaceModel`] with the throttling and bookkeeping the capture
/// loops rely on. One adapter per session; callers serialize access.
pub struct DetectorAdapter<M> {
    model: M,
    load_state: LoadState,
    governor: PerformanceGovernor,
    cached: Option<DetectionResult>,
    /// Set when the last actual run failed; throttled calls report it again.
    cached_failure: Option<String>,
    last_run: Option<Instant>,
}

impl<M: FaceModel> DetectorAdapter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            load_state: LoadState::NotLoaded,
            governor: PerformanceGovernor::new(),
            cached: None,
            cached_failure: None,
            last_run: None,
        }
    }

    /// Load the model once. Later calls report the first outcome without
    /// retrying.
    pub async fn initialize(&mut self) -> bool {
        match self.load_state {
            LoadState::Loaded => return true,
            LoadState::Failed => return false,
            LoadState::NotLoaded => {}
        }

        let start = Instant::now();
        match self.model.load().await {
            Ok(()) => {
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "face model loaded"
                );
                self.load_state = LoadState::Loaded;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "face model failed to load; detection disabled");
                self.load_state = LoadState::Failed;
                false
            }
        }
    }

    /// Detect the best face in `frame`, reporting model errors as no face.
    pub async fn detect(
        &mut self,
        frame: Arc<RgbImage>,
        min_confidence: f32,
    ) -> Option<DetectionResult> {
        match self.try_detect(frame, min_confidence).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                None
            }
        }
    }

    /// Detect the best face in `frame`, surfacing model errors.
    ///
    /// Within the current mode's throttle window the previous outcome is
    /// returned instead of running the model again. A failed run counts as
    /// a detection failure and is cached like a run that found no face:
    /// throttled calls after it see the failure again, never an older face.
    pub async fn try_detect(
        &mut self,
        frame: Arc<RgbImage>,
        min_confidence: f32,
    ) -> Result<Option<DetectionResult>, DetectorError> {
        if !self.initialize().await {
            return Err(DetectorError::NotLoaded);
        }

        let mode = self.governor.mode();
        if let Some(last) = self.last_run {
            if last.elapsed() < mode.min_interval() {
                tracing::trace!(?mode, "detection throttled; returning cached result");
                if let Some(reason) = &self.cached_failure {
                    return Err(DetectorError::PreviousRunFailed(reason.clone()));
                }
                return Ok(self.cached);
            }
        }

        let start = Instant::now();
        let outcome = self
            .model
            .detect_best(frame, mode.input_size(), min_confidence)
            .await;
        self.governor.record_latency(start.elapsed());

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.governor.record_failure();
                self.cached = None;
                self.cached_failure = Some(e.to_string());
                self.last_run = Some(Instant::now());
                return Err(e);
            }
        };

        if result.is_some() {
            self.governor.record_success();
        } else {
            self.governor.record_failure();
        }

        self.cached = result;
        self.cached_failure = None;
        self.last_run = Some(Instant::now());
        Ok(result)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.governor.consecutive_failures()
    }

    pub fn performance_mode(&self) -> PerformanceMode {
        self.governor.mode()
    }

    /// Forget cached results and adaptive state at a session boundary. The
    /// model itself stays loaded.
    pub fn reset(&mut self) {
        self.governor.reset();
        self.cached = None;
        self.cached_failure = None;
        self.last_run = None;
    }
}
