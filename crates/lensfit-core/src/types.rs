use serde::{Deserialize, Serialize};

/// Axis-aligned face box in native frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Outcome of one detector invocation that found a face.
///
/// "No face" is expressed as `Option::<DetectionResult>::None` throughout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub bounding_box: BoundingBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

impl DetectionResult {
    /// Face area as a fraction of the native frame area.
    pub fn area_fraction(&self, frame: FrameSize) -> f64 {
        let frame_area = frame.area();
        if frame_area == 0.0 {
            return 0.0;
        }
        self.bounding_box.area() as f64 / frame_area
    }
}

/// Native capture resolution of the camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

/// Size of the rendered preview element, in display pixels.
///
/// Differs from [`FrameSize`] whenever the preview is scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: f32,
    pub height: f32,
}

impl DisplaySize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

impl From<FrameSize> for DisplaySize {
    fn from(size: FrameSize) -> Self {
        Self {
            width: size.width as f32,
            height: size.height as f32,
        }
    }
}
