//! lensfit-hw — Hardware abstraction for live camera capture.
//!
//! Provides a V4L2-based live camera behind the [`CameraSource`] contract,
//! plus the frame conversions used to produce the final capture still.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, CameraSource, Resolution, StreamConstraints, V4l2Camera};
pub use frame::{CapturedImage, Frame, FrameError};
