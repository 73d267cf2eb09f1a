//! lensfit-capture — Guided auto-capture and remote face analysis.
//!
//! [`CaptureSession`] drives the camera, detector and guide geometry through
//! scanning, countdown and capture. [`AnalysisClient`] submits the resulting
//! still to the analysis service and waits for the verdict.

pub mod analysis;
pub mod session;
pub mod tuning;

pub use analysis::{
    AnalysisApi, AnalysisClient, AnalysisError, AnalysisOutcome, FaceAnalysis, HttpAnalysisApi,
};
pub use session::{
    CaptureError, CapturePhase, CaptureSession, CountdownState, QualityFlags, SessionSnapshot,
};
pub use tuning::{CaptureTuning, TuningError};
