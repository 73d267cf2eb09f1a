//! lensfit-core — Face detection and guide-region evaluation.
//!
//! Uses SCRFD for face detection via ONNX Runtime, wrapped in an adapter
//! that throttles inference according to measured latency.

pub mod adapter;
pub mod detector;
pub mod geometry;
pub mod governor;
pub mod types;

pub use adapter::DetectorAdapter;
pub use detector::{DetectorError, FaceModel, ScrfdModel};
pub use geometry::{evaluate_placement, is_in_guide_region, GuideRegion, Placement};
pub use governor::{PerformanceGovernor, PerformanceMode};
pub use types::{BoundingBox, DetectionResult, DisplaySize, FrameSize};
