//! Live camera sources.
//!
//! [`CameraSource`] is the contract the capture session drives. [`V4l2Camera`]
//! implements it with a dedicated capture thread that keeps the most recent
//! frame available for detection and for the final still.

use crate::frame::{self, Frame};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// How long `start` waits for the first frame before giving up.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera produced no frames within {0:?}")]
    NoFrames(Duration),
}

/// Requested stream shape. The device may deliver less.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1920,
            ideal_height: 1080,
        }
    }
}

/// Negotiated native resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A live video source exclusively owned by one capture session.
pub trait CameraSource: Send + Sync + 'static {
    /// Acquire the device and resolve once frames are flowing.
    fn start(
        &self,
        constraints: StreamConstraints,
    ) -> impl Future<Output = Result<Resolution, CameraError>> + Send;

    /// Release the device. Safe to call when not started.
    fn stop(&self);

    fn is_live(&self) -> bool;

    /// Most recent frame, if the stream is live.
    fn current_frame(&self) -> Option<Arc<Frame>>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpeg)
        } else {
            None
        }
    }

    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<image::RgbImage, String> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height).map_err(|e| e.to_string()),
            PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map(|img| img.to_rgb8())
                .map_err(|e| e.to_string()),
        }
    }
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
    resolution: Resolution,
}

/// V4L2 camera with a background capture thread.
pub struct V4l2Camera {
    device_path: String,
    latest: Arc<watch::Sender<Option<Arc<Frame>>>>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl V4l2Camera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            latest: Arc::new(watch::Sender::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }

    fn running_resolution(&self) -> Option<Resolution> {
        self.worker
            .lock()
            .ok()
            .and_then(|w| w.as_ref().map(|w| w.resolution))
    }
}

impl CameraSource for V4l2Camera {
    async fn start(&self, constraints: StreamConstraints) -> Result<Resolution, CameraError> {
        if let Some(resolution) = self.running_resolution() {
            return Ok(resolution);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let path = self.device_path.clone();
        let latest = Arc::clone(&self.latest);
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("lensfit-camera".into())
            .spawn(move || capture_loop(&path, constraints, &stop_flag, &latest, ready_tx))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        let negotiated = match ready_rx.await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CameraError::CaptureFailed("capture thread exited".into()));
            }
        };

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(CaptureWorker {
                stop,
                thread,
                resolution: negotiated,
            });
        }

        let mut frames = self.latest.subscribe();
        let first = tokio::time::timeout(FIRST_FRAME_TIMEOUT, frames.wait_for(|f| f.is_some()))
            .await
            .map(|seen| seen.is_ok());
        match first {
            Ok(true) => {
                tracing::info!(
                    device = %self.device_path,
                    width = negotiated.width,
                    height = negotiated.height,
                    "camera streaming"
                );
                Ok(negotiated)
            }
            _ => {
                self.stop();
                Err(CameraError::NoFrames(FIRST_FRAME_TIMEOUT))
            }
        }
    }

    fn stop(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            if worker.thread.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
            tracing::info!(device = %self.device_path, "camera released");
        }
        self.latest.send_replace(None);
    }

    fn is_live(&self) -> bool {
        self.running_resolution().is_some()
    }

    fn current_frame(&self) -> Option<Arc<Frame>> {
        self.latest.borrow().clone()
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_open_error(device_path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
        _ if e.to_string().contains("busy") || e.to_string().contains("EBUSY") => {
            CameraError::DeviceBusy
        }
        _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
    }
}

/// Open the device and negotiate the closest supported format.
fn open_device(
    device_path: &str,
    constraints: StreamConstraints,
) -> Result<(Device, PixelFormat, Resolution), CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;

    let caps = device.query_caps().map_err(|e| {
        CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
    })?;
    tracing::info!(
        device = device_path,
        driver = %caps.driver,
        card = %caps.card,
        "opened camera"
    );
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;

    // MJPG usually reaches higher resolutions over USB; fall back to YUYV.
    for fourcc in [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")] {
        fmt.fourcc = fourcc;
        fmt.width = constraints.ideal_width;
        fmt.height = constraints.ideal_height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        if let Some(pixel_format) = PixelFormat::from_fourcc(negotiated.fourcc) {
            tracing::info!(
                width = negotiated.width,
                height = negotiated.height,
                fourcc = ?negotiated.fourcc,
                "negotiated format"
            );
            let resolution = Resolution {
                width: negotiated.width,
                height: negotiated.height,
            };
            return Ok((device, pixel_format, resolution));
        }
    }

    Err(CameraError::FormatNegotiationFailed(
        "device supports neither MJPG nor YUYV".into(),
    ))
}

fn capture_loop(
    device_path: &str,
    constraints: StreamConstraints,
    stop: &AtomicBool,
    latest: &watch::Sender<Option<Arc<Frame>>>,
    ready: oneshot::Sender<Result<Resolution, CameraError>>,
) {
    let (device, pixel_format, resolution) = match open_device(device_path, constraints) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(CameraError::CaptureFailed(format!(
                "failed to create mmap stream: {e}"
            ))));
            return;
        }
    };

    if ready.send(Ok(resolution)).is_err() {
        return;
    }

    while !stop.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(device = device_path, error = %e, "failed to dequeue buffer");
                break;
            }
        };

        match pixel_format.decode(buf, resolution.width, resolution.height) {
            Ok(image) => {
                latest.send_replace(Some(Arc::new(Frame::new(image, meta.sequence))));
            }
            Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping undecodable frame"),
        }
    }

    tracing::debug!(device = device_path, "capture thread exiting");
}
