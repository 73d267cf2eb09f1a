//! Guide-region placement checks.
//!
//! The face box lives in native camera pixels while the guide overlay is
//! drawn in display pixels. Each is normalized by its own reference size
//! before comparing, so CSS-style scaling of the preview does not matter.

use crate::types::{DetectionResult, DisplaySize, FrameSize};
use serde::{Deserialize, Serialize};

const GUIDE_OFFSET: f32 = 0.37;
const GUIDE_SPAN: f32 = 0.26;

const BASE_TOLERANCE: f64 = 0.15;
const WIDENED_TOLERANCE_FACTOR: f64 = 1.3;
/// Failures strictly above this widen the position tolerance.
const WIDEN_AFTER_FAILURES: u32 = 5;

/// Ideal face area as a fraction of the frame (30% x 30%).
const IDEAL_AREA_FRACTION: f64 = 0.09;
const MIN_SIZE_RATIO: f64 = 0.4;
const MAX_SIZE_RATIO: f64 = 2.0;
/// Keeps the inclusive ratio bounds inclusive under float rounding.
const RATIO_EPSILON: f64 = 1e-9;

/// Target capture area in display pixels, relative to the preview's box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl GuideRegion {
    /// The standard centered guide for a preview of the given size.
    pub fn centered(display: DisplaySize) -> Self {
        Self {
            x: display.width * GUIDE_OFFSET,
            y: display.height * GUIDE_OFFSET,
            width: display.width * GUIDE_SPAN,
            height: display.height * GUIDE_SPAN,
        }
    }

    /// Center in display-normalized coordinates.
    fn normalized_center(&self, display: DisplaySize) -> Option<(f64, f64)> {
        if display.width <= 0.0 || display.height <= 0.0 {
            return None;
        }
        Some((
            (self.x as f64 + self.width as f64 / 2.0) / display.width as f64,
            (self.y as f64 + self.height as f64 / 2.0) / display.height as f64,
        ))
    }
}

/// How a detection sits relative to the guide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub offset_x: f64,
    pub offset_y: f64,
    pub tolerance: f64,
    pub size_ratio: f64,
}

impl Placement {
    pub fn is_positioned(&self) -> bool {
        self.offset_x < self.tolerance && self.offset_y < self.tolerance
    }

    pub fn is_sized(&self) -> bool {
        self.size_ratio >= MIN_SIZE_RATIO - RATIO_EPSILON
            && self.size_ratio <= MAX_SIZE_RATIO + RATIO_EPSILON
    }

    pub fn accepted(&self) -> bool {
        self.is_positioned() && self.is_sized()
    }
}

/// Position tolerance, widened once detection has been failing for a while.
pub fn position_tolerance(consecutive_failures: u32) -> f64 {
    if consecutive_failures > WIDEN_AFTER_FAILURES {
        BASE_TOLERANCE * WIDENED_TOLERANCE_FACTOR
    } else {
        BASE_TOLERANCE
    }
}

/// Measure a detection against the guide. `None` if there is no detection
/// or either reference size is degenerate.
pub fn evaluate_placement(
    detection: Option<&DetectionResult>,
    native: FrameSize,
    display: DisplaySize,
    guide: &GuideRegion,
    consecutive_failures: u32,
) -> Option<Placement> {
    let detection = detection?;
    if native.width == 0 || native.height == 0 {
        return None;
    }
    let (guide_x, guide_y) = guide.normalized_center(display)?;

    let (cx, cy) = detection.bounding_box.center();
    let face_x = cx as f64 / native.width as f64;
    let face_y = cy as f64 / native.height as f64;

    Some(Placement {
        offset_x: (face_x - guide_x).abs(),
        offset_y: (face_y - guide_y).abs(),
        tolerance: position_tolerance(consecutive_failures),
        size_ratio: detection.area_fraction(native) / IDEAL_AREA_FRACTION,
    })
}

/// True when the face is centered on the guide and sized within bounds.
pub fn is_in_guide_region(
    detection: Option<&DetectionResult>,
    native: FrameSize,
    display: DisplaySize,
    guide: &GuideRegion,
    consecutive_failures: u32,
) -> bool {
    evaluate_placement(detection, native, display, guide, consecutive_failures)
        .is_some_and(|p| p.accepted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    const NATIVE: FrameSize = FrameSize { width: 1000, height: 1000 };

    fn display() -> DisplaySize {
        DisplaySize::new(500.0, 500.0)
    }

    /// A square face centered at normalized (cx, cy) with the given size ratio.
    fn face(cx: f32, cy: f32, size_ratio: f64) -> DetectionResult {
        let side = ((size_ratio * IDEAL_AREA_FRACTION).sqrt() * 1000.0) as f32;
        DetectionResult {
            bounding_box: BoundingBox {
                x: cx * 1000.0 - side / 2.0,
                y: cy * 1000.0 - side / 2.0,
                width: side,
                height: side,
            },
            confidence: 0.9,
        }
    }

    fn check(det: &DetectionResult, failures: u32) -> bool {
        let guide = GuideRegion::centered(display());
        is_in_guide_region(Some(det), NATIVE, display(), &guide, failures)
    }

    #[test]
    fn test_centered_guide() {
        let g = GuideRegion::centered(DisplaySize::new(1000.0, 500.0));
        assert!((g.x - 370.0).abs() < 1e-3);
        assert!((g.y - 185.0).abs() < 1e-3);
        assert!((g.width - 260.0).abs() < 1e-3);
        assert!((g.height - 130.0).abs() < 1e-3);
    }

    #[test]
    fn test_no_detection() {
        let guide = GuideRegion::centered(display());
        assert!(!is_in_guide_region(None, NATIVE, display(), &guide, 0));
    }

    #[test]
    fn test_centered_ideal_face_accepted() {
        assert!(check(&face(0.5, 0.5, 1.0), 0));
    }

    #[test]
    fn test_offset_beyond_tolerance_on_one_axis() {
        assert!(!check(&face(0.66, 0.5, 1.0), 0));
        assert!(!check(&face(0.5, 0.34, 1.0), 0));
        assert!(check(&face(0.64, 0.5, 1.0), 0));
    }

    #[test]
    fn test_tolerance_widens_after_failures() {
        // 0.17 fails at 0.15 but passes at 0.15 * 1.3 = 0.195.
        let det = face(0.67, 0.5, 1.0);
        assert!(!check(&det, 0));
        assert!(!check(&det, 5));
        assert!(check(&det, 6));
    }

    #[test]
    fn test_size_ratio_bounds_inclusive() {
        let guide = GuideRegion::centered(display());
        let placement = |ratio: f64| {
            evaluate_placement(Some(&face(0.5, 0.5, ratio)), NATIVE, display(), &guide, 0)
                .unwrap()
        };
        // Rebuild exact ratios to avoid pixel rounding in `face`.
        let with_ratio = |ratio: f64| Placement { size_ratio: ratio, ..placement(1.0) };

        assert!(with_ratio(0.4).accepted());
        assert!(with_ratio(2.0).accepted());
        assert!(!with_ratio(0.39).accepted());
        assert!(!with_ratio(2.01).accepted());
    }

    #[test]
    fn test_size_ratio_from_pixels() {
        // 600x600 box in 1000x1000 frame: area 0.36, ratio 4.0.
        assert!(!check(&face(0.5, 0.5, 4.0), 0));
        // 0.1 ratio: far too small.
        assert!(!check(&face(0.5, 0.5, 0.1), 0));
        assert!(check(&face(0.5, 0.5, 1.9), 0));
    }

    #[test]
    fn test_mixed_coordinate_spaces() {
        // Native 1920x1080 face centered; display scaled to 640x360.
        let native = FrameSize::new(1920, 1080);
        let display = DisplaySize::new(640.0, 360.0);
        let guide = GuideRegion::centered(display);
        let det = DetectionResult {
            bounding_box: BoundingBox { x: 672.0, y: 378.0, width: 576.0, height: 324.0 },
            confidence: 0.8,
        };
        let p = evaluate_placement(Some(&det), native, display, &guide, 0).unwrap();
        assert!(p.offset_x < 1e-6 && p.offset_y < 1e-6);
        assert!((p.size_ratio - 1.0).abs() < 1e-6);
        assert!(p.accepted());
    }

    #[test]
    fn test_degenerate_display() {
        let guide = GuideRegion::centered(display());
        let det = face(0.5, 0.5, 1.0);
        assert!(!is_in_guide_region(
            Some(&det),
            NATIVE,
            DisplaySize::new(0.0, 0.0),
            &guide,
            0
        ));
    }
}
