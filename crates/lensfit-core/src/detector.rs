//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The input size is chosen per call so the adapter can trade accuracy for
//! latency.

use crate::types::{BoundingBox, DetectionResult};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_500m.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("model not loaded")]
    NotLoaded,
    #[error("input size {0} is not a multiple of 32")]
    InvalidInputSize(u32),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("last detection run failed: {0}")]
    PreviousRunFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection runtime: one-time async load, then best-face queries.
pub trait FaceModel: Send + Sync + 'static {
    /// Load weights. Called at most once by the adapter.
    fn load(&self) -> impl Future<Output = Result<(), DetectorError>> + Send;

    /// Return the single most confident face at or above `min_confidence`.
    fn detect_best(
        &self,
        frame: Arc<RgbImage>,
        input_size: u32,
        min_confidence: f32,
    ) -> impl Future<Output = Result<Option<DetectionResult>, DetectorError>> + Send;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Loaded ONNX session plus its discovered output layout.
struct ScrfdSession {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdSession {
    fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    fn detect(
        &mut self,
        frame: &RgbImage,
        input_size: u32,
        min_confidence: f32,
    ) -> Result<Option<DetectionResult>, DetectorError> {
        if input_size == 0 || input_size % 32 != 0 {
            return Err(DetectorError::InvalidInputSize(input_size));
        }
        let side = input_size as usize;
        let (input, letterbox) = preprocess(frame, side);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                side,
                &letterbox,
                min_confidence,
            ));
        }

        Ok(nms(all_detections, SCRFD_NMS_THRESHOLD).into_iter().next())
    }
}

/// SCRFD-based face model. Inference runs on the blocking pool.
pub struct ScrfdModel {
    path: PathBuf,
    session: Arc<Mutex<Option<ScrfdSession>>>,
}

impl ScrfdModel {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            path: model_path.into(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FaceModel for ScrfdModel {
    async fn load(&self) -> Result<(), DetectorError> {
        let path = self.path.clone();
        let slot = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let loaded = ScrfdSession::load(&path)?;
            let mut guard = slot
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
            *guard = Some(loaded);
            Ok(())
        })
        .await
        .map_err(|e| DetectorError::InferenceFailed(format!("load task: {e}")))?
    }

    async fn detect_best(
        &self,
        frame: Arc<RgbImage>,
        input_size: u32,
        min_confidence: f32,
    ) -> Result<Option<DetectionResult>, DetectorError> {
        let slot = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
            let session = guard.as_mut().ok_or(DetectorError::NotLoaded)?;
            session.detect(&frame, input_size, min_confidence)
        })
        .await
        .map_err(|e| DetectorError::InferenceFailed(format!("detect task: {e}")))?
    }
}

/// Letterbox an RGB frame into a square NCHW float tensor.
fn preprocess(frame: &RgbImage, side: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = frame.dimensions();
    let letterbox = letterbox_for(width as usize, height as usize, side);

    let new_w = ((width as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((height as f32 * letterbox.scale).round() as u32).max(1);
    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;

    // Pad value is SCRFD_MEAN, which normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x_start;
        let ty = y as usize + pad_y_start;
        if tx >= side || ty >= side {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

fn letterbox_for(width: usize, height: usize, side: usize) -> LetterboxInfo {
    let scale = (side as f32 / width.max(1) as f32).min(side as f32 / height.max(1) as f32);
    let new_w = (width as f32 * scale).round();
    let new_h = (height as f32 * scale).round();
    LetterboxInfo {
        scale,
        pad_x: (side as f32 - new_w) / 2.0,
        pad_y: (side as f32 - new_h) / 2.0,
    }
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped directly. Otherwise
/// falls back to the standard positional ordering: [0-2] scores, [3-5] bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    side: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<DetectionResult> {
    let grid = side / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid * stride) as f32;
        let anchor_cy = (anchor_idx / grid * stride) as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let s = stride as f32;
        let x1 = (anchor_cx - bboxes[off] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_cy - bboxes[off + 1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_cx + bboxes[off + 2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_cy + bboxes[off + 3] * s - letterbox.pad_y) / letterbox.scale;

        detections.push(DetectionResult {
            bounding_box: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<DetectionResult>, iou_threshold: f32) -> Vec<DetectionResult> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<DetectionResult> = Vec::new();
    for det in detections {
        if keep
            .iter()
            .all(|k| iou(&k.bounding_box, &det.bounding_box) <= iou_threshold)
        {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
