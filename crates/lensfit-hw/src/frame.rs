//! Frame type and image processing: YUYV conversion, capture framing, JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Shared so detection can run on another thread without copying.
    pub image: Arc<RgbImage>,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image: Arc::new(image),
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// The final still handed to the analysis service.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for &y in [chunk[0], chunk[2]].iter() {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Largest centered square of `frame`, scaled to `size`×`size` and mirrored
/// horizontally to match the on-screen preview.
pub fn crop_square_mirrored(frame: &RgbImage, size: u32) -> Result<RgbImage, FrameError> {
    let (w, h) = frame.dimensions();
    let side = w.min(h);
    if side == 0 || size == 0 {
        return Err(FrameError::Empty);
    }
    let x = (w - side) / 2;
    let y = (h - side) / 2;

    let square = imageops::crop_imm(frame, x, y, side, side).to_image();
    let scaled = if side == size {
        square
    } else {
        imageops::resize(&square, size, size, FilterType::Triangle)
    };
    Ok(imageops::flip_horizontal(&scaled))
}

/// Encode an RGB image as baseline JPEG. `quality` is 1–100.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}

/// Crop, mirror and encode a frame for upload.
pub fn capture_still(frame: &Frame, size: u32, quality: u8) -> Result<CapturedImage, FrameError> {
    let framed = crop_square_mirrored(&frame.image, size)?;
    let jpeg = encode_jpeg(&framed, quality)?;
    Ok(CapturedImage {
        jpeg,
        width: framed.width(),
        height: framed.height(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has no pixels")]
    Empty,
    #[error("JPEG encode failed: {0}")]
    Encode(String),
}
