//! Guided auto-capture session.
//!
//! The session owns the camera and drives three timer chains: the scanning
//! loop, the countdown ticker and the countdown monitor. All state lives in
//! one [`Machine`] behind a mutex; observers read it through a `watch`
//! channel. Every timer task carries the epoch it was spawned in and
//! re-checks it under the lock before acting, and every clear bumps the
//! epoch, so a callback that was already running when the session stopped
//! cannot act on the new state.

use crate::tuning::CaptureTuning;
use lensfit_core::{
    is_in_guide_region, DetectionResult, DetectorAdapter, DetectorError, DisplaySize, FaceModel,
    FrameSize, GuideRegion, PerformanceMode,
};
use lensfit_hw::frame::capture_still;
use lensfit_hw::{CameraError, CameraSource, CapturedImage, FrameError, StreamConstraints};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("no camera frame available")]
    FrameUnavailable,
    #[error("cannot capture while {0:?}")]
    NotCapturing(CapturePhase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    Idle,
    CameraStarting,
    Scanning,
    Countdown,
    Captured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountdownState {
    pub is_counting_down: bool,
    pub remaining: u32,
    /// Raised briefly after a countdown is abandoned.
    pub cancelled: bool,
}

impl CountdownState {
    fn initial(from: u32) -> Self {
        Self {
            is_counting_down: false,
            remaining: from,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityFlags {
    pub low_quality_warning: bool,
    pub no_face_hint: bool,
}

/// Why a countdown was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    NoFace,
    OutOfRegion,
}

/// Observable view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub phase: CapturePhase,
    pub camera_active: bool,
    pub countdown: CountdownState,
    pub quality: QualityFlags,
    pub consecutive_detection_failures: u32,
    pub performance_mode: PerformanceMode,
    pub guide_visible: bool,
    pub guide: Option<GuideRegion>,
    pub has_captured_image: bool,
    pub last_error: Option<String>,
}

/// Result of one detect + geometry pass.
#[derive(Debug, Clone, Copy)]
struct FrameCheck {
    detection: Option<DetectionResult>,
    native: FrameSize,
    in_region: bool,
    failures: u32,
    mode: PerformanceMode,
}

#[derive(Default)]
struct Timers {
    scan: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    cancel_flash: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.scan.take(),
            self.ticker.take(),
            self.monitor.take(),
            self.cancel_flash.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Machine {
    phase: CapturePhase,
    camera_active: bool,
    countdown: CountdownState,
    quality: QualityFlags,
    failures: u32,
    mode: PerformanceMode,
    guide_visible: bool,
    display: Option<DisplaySize>,
    guide: Option<GuideRegion>,
    captured: Option<Arc<CapturedImage>>,
    last_error: Option<String>,
    epoch: u64,
    timers: Timers,
}

impl Machine {
    fn new(countdown_from: u32) -> Self {
        Self {
            phase: CapturePhase::Idle,
            camera_active: false,
            countdown: CountdownState::initial(countdown_from),
            quality: QualityFlags::default(),
            failures: 0,
            mode: PerformanceMode::default(),
            guide_visible: false,
            display: None,
            guide: None,
            captured: None,
            last_error: None,
            epoch: 0,
            timers: Timers::default(),
        }
    }

    fn is_current(&self, epoch: u64, phase: CapturePhase) -> bool {
        self.epoch == epoch && self.phase == phase
    }

    /// Display size and guide for a frame of the given native size. The
    /// preview defaults to the native size until the UI reports otherwise.
    fn geometry(&self, native: FrameSize) -> (DisplaySize, GuideRegion) {
        let display = self.display.unwrap_or_else(|| native.into());
        let guide = self.guide.unwrap_or_else(|| GuideRegion::centered(display));
        (display, guide)
    }

    fn note_detector(&mut self, check: &FrameCheck) {
        self.failures = check.failures;
        self.mode = check.mode;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            camera_active: self.camera_active,
            countdown: self.countdown,
            quality: self.quality,
            consecutive_detection_failures: self.failures,
            performance_mode: self.mode,
            guide_visible: self.guide_visible,
            guide: self.guide,
            has_captured_image: self.captured.is_some(),
            last_error: self.last_error.clone(),
        }
    }
}

struct Shared<C, M> {
    camera: C,
    detector: tokio::sync::Mutex<DetectorAdapter<M>>,
    tuning: CaptureTuning,
    machine: Mutex<Machine>,
    events: watch::Sender<SessionSnapshot>,
}

/// Handle to a guided capture session. Clones share the same session.
pub struct CaptureSession<C, M> {
    shared: Arc<Shared<C, M>>,
}

impl<C, M> Clone for CaptureSession<C, M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: CameraSource, M: FaceModel> CaptureSession<C, M> {
    pub fn new(camera: C, model: M, tuning: CaptureTuning) -> Self {
        let machine = Machine::new(tuning.countdown_from);
        let (events, _) = watch::channel(machine.snapshot());
        Self {
            shared: Arc::new(Shared {
                camera,
                detector: tokio::sync::Mutex::new(DetectorAdapter::new(model)),
                tuning,
                machine: Mutex::new(machine),
                events,
            }),
        }
    }

    pub fn tuning(&self) -> &CaptureTuning {
        &self.shared.tuning
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.events.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.events.subscribe()
    }

    pub fn captured_image(&self) -> Option<Arc<CapturedImage>> {
        self.machine().captured.clone()
    }

    /// Acquire the camera and begin scanning.
    ///
    /// Starting a session that is already live is a no-op. On failure the
    /// camera is released, the error is recorded for display and the
    /// session returns to idle.
    pub async fn start_camera(&self) -> Result<(), CaptureError> {
        let epoch = {
            let mut m = self.machine();
            match m.phase {
                CapturePhase::CameraStarting | CapturePhase::Scanning | CapturePhase::Countdown => {
                    return Ok(());
                }
                CapturePhase::Idle | CapturePhase::Captured => {}
            }
            if m.camera_active {
                // Live preview with auto-capture paused.
                self.start_scanning(&mut m);
                self.publish(&m);
                return Ok(());
            }
            m.phase = CapturePhase::CameraStarting;
            m.captured = None;
            m.last_error = None;
            m.quality = QualityFlags::default();
            m.countdown = CountdownState::initial(self.shared.tuning.countdown_from);
            m.epoch += 1;
            self.publish(&m);
            m.epoch
        };

        // Warm the model while the camera spins up.
        let preload = self.clone();
        tokio::spawn(async move {
            preload.shared.detector.lock().await.initialize().await;
        });

        let constraints = StreamConstraints {
            ideal_width: self.shared.tuning.ideal_width,
            ideal_height: self.shared.tuning.ideal_height,
        };
        tracing::info!(
            ideal_width = constraints.ideal_width,
            ideal_height = constraints.ideal_height,
            "starting camera"
        );
        let result = self.shared.camera.start(constraints).await;

        let mut m = self.machine();
        if !m.is_current(epoch, CapturePhase::CameraStarting) {
            tracing::debug!("camera start superseded by stop");
            // A newer start still waiting on the device owns it now.
            let release = result.is_ok() && m.phase != CapturePhase::CameraStarting;
            drop(m);
            if release {
                self.shared.camera.stop();
            }
            return Ok(());
        }

        match result {
            Ok(resolution) => {
                m.camera_active = true;
                m.guide_visible = true;
                if m.guide.is_none() {
                    let native = FrameSize::new(resolution.width, resolution.height);
                    let (_, guide) = m.geometry(native);
                    m.guide = Some(guide);
                }
                tracing::info!(
                    width = resolution.width,
                    height = resolution.height,
                    "camera live; scanning"
                );
                self.start_scanning(&mut m);
                self.publish(&m);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "camera start failed");
                m.phase = CapturePhase::Idle;
                m.camera_active = false;
                m.guide_visible = false;
                m.last_error = Some(e.to_string());
                self.publish(&m);
                drop(m);
                self.shared.camera.stop();
                Err(e.into())
            }
        }
    }

    /// Resume scanning on a live camera after [`stop_auto_capture`](Self::stop_auto_capture).
    pub fn start_auto_capture(&self) {
        let mut m = self.machine();
        if m.camera_active && m.phase == CapturePhase::Idle {
            self.start_scanning(&mut m);
            self.publish(&m);
        }
    }

    /// Clear every pending timer and reset the countdown. A live camera
    /// stays live; one still starting is released when it comes up. Safe
    /// to call in any state.
    pub fn stop_auto_capture(&self) {
        let mut m = self.machine();
        self.clear_timers(&mut m);
        if matches!(
            m.phase,
            CapturePhase::CameraStarting | CapturePhase::Scanning | CapturePhase::Countdown
        ) {
            m.phase = CapturePhase::Idle;
        }
        self.publish(&m);
    }

    /// Stop auto-capture and release the camera.
    pub fn stop_camera(&self) {
        let mut m = self.machine();
        self.clear_timers(&mut m);
        m.camera_active = false;
        m.guide_visible = false;
        m.phase = if m.captured.is_some() {
            CapturePhase::Captured
        } else {
            CapturePhase::Idle
        };
        self.publish(&m);
        drop(m);

        self.shared.camera.stop();
        tracing::info!("camera stopped");
    }

    /// Tear the session down to its initial state, dropping any captured
    /// image and the detector's adaptive state.
    pub async fn reset(&self) {
        {
            let mut m = self.machine();
            self.clear_timers(&mut m);
            m.phase = CapturePhase::Idle;
            m.camera_active = false;
            m.guide_visible = false;
            m.captured = None;
            m.quality = QualityFlags::default();
            m.last_error = None;
            m.failures = 0;
            m.mode = PerformanceMode::default();
            self.publish(&m);
        }
        self.shared.camera.stop();
        self.shared.detector.lock().await.reset();
        tracing::info!("capture session reset");
    }

    /// Discard the current photo and start over.
    pub async fn retake(&self) -> Result<(), CaptureError> {
        self.reset().await;
        self.start_camera().await
    }

    /// Capture immediately, bypassing the quality gate and countdown.
    pub fn capture_now(&self) -> Result<(), CaptureError> {
        let mut m = self.machine();
        if !matches!(m.phase, CapturePhase::Scanning | CapturePhase::Countdown) {
            return Err(CaptureError::NotCapturing(m.phase));
        }
        self.clear_timers(&mut m);
        let result = self.capture(&mut m);
        if result.is_err() {
            self.start_scanning(&mut m);
        }
        self.publish(&m);
        drop(m);

        if result.is_ok() {
            self.shared.camera.stop();
        }
        result
    }

    /// The preview element was resized; recompute the guide region.
    pub fn set_display_size(&self, display: DisplaySize) {
        let mut m = self.machine();
        m.display = Some(display);
        m.guide = Some(GuideRegion::centered(display));
        let DisplaySize { width, height } = display;
        tracing::debug!(width, height, "display resized");
        self.publish(&m);
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.shared
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, m: &Machine) {
        let next = m.snapshot();
        self.shared.events.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn clear_timers(&self, m: &mut Machine) {
        m.timers.abort_all();
        m.epoch += 1;
        m.countdown = CountdownState::initial(self.shared.tuning.countdown_from);
    }

    fn start_scanning(&self, m: &mut Machine) {
        m.epoch += 1;
        m.phase = CapturePhase::Scanning;
        let epoch = m.epoch;
        let this = self.clone();
        m.timers.scan = Some(tokio::spawn(this.scan_loop(epoch)));
    }

    /// Enter the countdown. No-op unless scanning and not already counting.
    fn begin_countdown(&self, m: &mut Machine) -> bool {
        if m.countdown.is_counting_down || m.phase != CapturePhase::Scanning {
            return false;
        }
        m.timers.abort_all();
        m.epoch += 1;
        m.phase = CapturePhase::Countdown;
        m.countdown = CountdownState {
            is_counting_down: true,
            remaining: self.shared.tuning.countdown_from,
            cancelled: false,
        };
        let epoch = m.epoch;
        m.timers.ticker = Some(tokio::spawn(self.clone().countdown_ticker(epoch)));
        m.timers.monitor = Some(tokio::spawn(self.clone().countdown_monitor(epoch)));
        tracing::info!(from = m.countdown.remaining, "countdown started");
        true
    }

    /// Crop, mirror and encode the live frame. The caller releases the
    /// camera once the machine lock is dropped.
    fn capture(&self, m: &mut Machine) -> Result<(), CaptureError> {
        let frame = self
            .shared
            .camera
            .current_frame()
            .ok_or(CaptureError::FrameUnavailable)?;
        let tuning = &self.shared.tuning;
        let still = capture_still(&frame, tuning.output_size, tuning.jpeg_quality)?;

        tracing::info!(
            bytes = still.jpeg.len(),
            width = still.width,
            height = still.height,
            "photo captured"
        );
        m.camera_active = false;
        m.guide_visible = false;
        m.captured = Some(Arc::new(still));
        m.phase = CapturePhase::Captured;
        Ok(())
    }

    /// Run detection on the live frame and judge it against the guide.
    async fn check_frame(&self, epoch: u64) -> Result<FrameCheck, CaptureError> {
        let frame = self
            .shared
            .camera
            .current_frame()
            .ok_or(CaptureError::FrameUnavailable)?;
        let native = FrameSize::new(frame.width(), frame.height());

        let (detection, failures, mode) = {
            let mut detector = self.shared.detector.lock().await;
            let detection = detector
                .try_detect(Arc::clone(&frame.image), self.shared.tuning.detection_min_confidence)
                .await;
            (detection, detector.consecutive_failures(), detector.performance_mode())
        };
        let detection = match detection {
            Ok(detection) => detection,
            Err(e) => {
                let mut m = self.machine();
                if m.epoch == epoch {
                    m.failures = failures;
                    m.mode = mode;
                    self.publish(&m);
                }
                return Err(e.into());
            }
        };

        let (display, guide) = self.machine().geometry(native);
        let in_region = is_in_guide_region(detection.as_ref(), native, display, &guide, failures);

        Ok(FrameCheck {
            detection,
            native,
            in_region,
            failures,
            mode,
        })
    }

    async fn scan_loop(self, epoch: u64) {
        loop {
            tokio::time::sleep(self.shared.tuning.scan_interval()).await;
            if !self.machine().is_current(epoch, CapturePhase::Scanning) {
                return;
            }
            let check = self.check_frame(epoch).await;
            if !self.on_scan(epoch, check) {
                return;
            }
        }
    }

    /// Apply one scanning result. Returns whether scanning continues.
    fn on_scan(&self, epoch: u64, check: Result<FrameCheck, CaptureError>) -> bool {
        let mut m = self.machine();
        if !m.is_current(epoch, CapturePhase::Scanning) {
            return false;
        }

        let check = match check {
            Ok(check) => check,
            Err(e) => {
                // Treated as no face; scanning carries on.
                tracing::warn!(error = %e, "scan: frame check failed");
                m.quality.no_face_hint = true;
                self.publish(&m);
                return true;
            }
        };
        m.note_detector(&check);

        let Some(detection) = check.detection else {
            if !m.quality.no_face_hint {
                tracing::debug!("scan: no face");
                m.quality.no_face_hint = true;
            }
            self.publish(&m);
            return true;
        };
        m.quality.no_face_hint = false;

        let tuning = &self.shared.tuning;
        let area = detection.area_fraction(check.native);
        let quality_ok =
            detection.confidence >= tuning.quality_min_confidence && area >= tuning.quality_min_area;
        m.quality.low_quality_warning = !quality_ok;

        tracing::debug!(
            confidence = detection.confidence,
            area,
            in_region = check.in_region,
            quality_ok,
            "scan: face"
        );

        let keep_scanning = !(quality_ok && check.in_region && self.begin_countdown(&mut m));
        self.publish(&m);
        keep_scanning
    }

    async fn countdown_ticker(self, epoch: u64) {
        loop {
            tokio::time::sleep(self.shared.tuning.countdown_tick()).await;
            if !self.on_tick(epoch) {
                return;
            }
        }
    }

    /// Decrement the countdown; capture on zero. Returns whether to keep ticking.
    fn on_tick(&self, epoch: u64) -> bool {
        let mut m = self.machine();
        // A cancellation bumps the epoch under this same lock, so it always
        // wins over a tick that reaches zero.
        if !m.is_current(epoch, CapturePhase::Countdown) {
            return false;
        }

        m.countdown.remaining = m.countdown.remaining.saturating_sub(1);
        if m.countdown.remaining > 0 {
            tracing::debug!(remaining = m.countdown.remaining, "countdown tick");
            self.publish(&m);
            return true;
        }

        self.clear_timers(&mut m);
        let captured = match self.capture(&mut m) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "auto capture failed; resuming scan");
                self.start_scanning(&mut m);
                false
            }
        };
        self.publish(&m);
        drop(m);

        if captured {
            self.shared.camera.stop();
        }
        false
    }

    async fn countdown_monitor(self, epoch: u64) {
        tokio::time::sleep(self.shared.tuning.monitor_grace()).await;
        loop {
            {
                let m = self.machine();
                if !m.is_current(epoch, CapturePhase::Countdown) || !m.camera_active {
                    return;
                }
            }

            match self.check_frame(epoch).await {
                Ok(check) => {
                    let reason = match check.detection {
                        None => Some(CancelReason::NoFace),
                        Some(_) if !check.in_region => Some(CancelReason::OutOfRegion),
                        Some(_) => None,
                    };
                    match reason {
                        Some(reason) => {
                            self.cancel_countdown(epoch, reason, &check);
                            return;
                        }
                        None => self.note_monitor(epoch, &check),
                    }
                }
                // Transient faults must not throw away a held pose.
                Err(e) => tracing::warn!(error = %e, "monitor: frame check failed; continuing"),
            }

            tokio::time::sleep(self.shared.tuning.monitor_interval()).await;
        }
    }

    fn note_monitor(&self, epoch: u64, check: &FrameCheck) {
        let mut m = self.machine();
        if m.is_current(epoch, CapturePhase::Countdown) {
            m.note_detector(check);
            self.publish(&m);
        }
    }

    fn cancel_countdown(&self, epoch: u64, reason: CancelReason, check: &FrameCheck) {
        let mut m = self.machine();
        if !m.is_current(epoch, CapturePhase::Countdown) {
            return;
        }
        tracing::info!(?reason, remaining = m.countdown.remaining, "countdown cancelled");

        m.note_detector(check);
        self.clear_timers(&mut m);
        m.countdown.cancelled = true;
        if check.detection.is_none() {
            m.quality.no_face_hint = true;
        }
        self.start_scanning(&mut m);

        let this = self.clone();
        let flash = self.shared.tuning.cancel_flash();
        m.timers.cancel_flash = Some(tokio::spawn(async move {
            tokio::time::sleep(flash).await;
            let mut m = this.machine();
            m.countdown.cancelled = false;
            this.publish(&m);
        }));

        self.publish(&m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use lensfit_core::BoundingBox;
    use lensfit_hw::{Frame, Resolution};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    const W: u32 = 1280;
    const H: u32 = 720;

    struct CameraState {
        fail: bool,
        start_delay: Duration,
        live: AtomicBool,
        starts: AtomicUsize,
        /// Stops that ran while the session's machine lock was held.
        locked_stops: AtomicUsize,
        session: OnceLock<Weak<Shared<FakeCamera, ControlledModel>>>,
        frame: Arc<Frame>,
    }

    #[derive(Clone)]
    struct FakeCamera(Arc<CameraState>);

    impl FakeCamera {
        fn new(fail: bool, start_delay: Duration) -> Self {
            Self(Arc::new(CameraState {
                fail,
                start_delay,
                live: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                locked_stops: AtomicUsize::new(0),
                session: OnceLock::new(),
                frame: Arc::new(Frame::new(RgbImage::from_pixel(W, H, Rgb([120, 110, 100])), 1)),
            }))
        }

        fn starts(&self) -> usize {
            self.0.starts.load(Ordering::SeqCst)
        }

        fn locked_stops(&self) -> usize {
            self.0.locked_stops.load(Ordering::SeqCst)
        }
    }

    impl CameraSource for FakeCamera {
        async fn start(&self, _constraints: StreamConstraints) -> Result<Resolution, CameraError> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            if !self.0.start_delay.is_zero() {
                tokio::time::sleep(self.0.start_delay).await;
            }
            if self.0.fail {
                return Err(CameraError::PermissionDenied("/dev/video0".into()));
            }
            self.0.live.store(true, Ordering::SeqCst);
            Ok(Resolution { width: W, height: H })
        }

        fn stop(&self) {
            if let Some(shared) = self.0.session.get().and_then(Weak::upgrade) {
                if shared.machine.try_lock().is_err() {
                    self.0.locked_stops.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.0.live.store(false, Ordering::SeqCst);
        }

        fn is_live(&self) -> bool {
            self.0.live.load(Ordering::SeqCst)
        }

        fn current_frame(&self) -> Option<Arc<Frame>> {
            self.is_live().then(|| Arc::clone(&self.0.frame))
        }
    }

    /// Model whose answer the test flips between steps.
    #[derive(Clone, Default)]
    struct ControlledModel {
        face: Arc<Mutex<Option<DetectionResult>>>,
        failing: Arc<AtomicBool>,
    }

    impl ControlledModel {
        fn set(&self, face: Option<DetectionResult>) {
            *self.face.lock().unwrap() = face;
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl FaceModel for ControlledModel {
        async fn load(&self) -> Result<(), DetectorError> {
            Ok(())
        }

        async fn detect_best(
            &self,
            _frame: Arc<RgbImage>,
            _input_size: u32,
            _min_confidence: f32,
        ) -> Result<Option<DetectionResult>, DetectorError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DetectorError::InferenceFailed("injected".into()));
            }
            Ok(*self.face.lock().unwrap())
        }
    }

    /// Face at normalized center (cx, cy) covering 9% of the frame.
    fn face_at(cx: f32, cy: f32, confidence: f32) -> DetectionResult {
        let (w, h) = (W as f32 * 0.3, H as f32 * 0.3);
        DetectionResult {
            bounding_box: BoundingBox {
                x: cx * W as f32 - w / 2.0,
                y: cy * H as f32 - h / 2.0,
                width: w,
                height: h,
            },
            confidence,
        }
    }

    fn centered() -> Option<DetectionResult> {
        Some(face_at(0.5, 0.5, 0.8))
    }

    type TestSession = CaptureSession<FakeCamera, ControlledModel>;

    fn session_with(camera: FakeCamera) -> (TestSession, FakeCamera, ControlledModel) {
        let model = ControlledModel::default();
        let session = CaptureSession::new(camera.clone(), model.clone(), CaptureTuning::default());
        let _ = camera.0.session.set(Arc::downgrade(&session.shared));
        (session, camera, model)
    }

    fn session(fail_camera: bool) -> (TestSession, FakeCamera, ControlledModel) {
        session_with(FakeCamera::new(fail_camera, Duration::ZERO))
    }

    /// Session whose camera takes 100 ms to come up.
    fn slow_session() -> (TestSession, FakeCamera, ControlledModel) {
        session_with(FakeCamera::new(false, Duration::from_millis(100)))
    }

    fn spawn_start(session: &TestSession) -> JoinHandle<Result<(), CaptureError>> {
        let session = session.clone();
        tokio::spawn(async move { session.start_camera().await })
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn assert_countdown_reset(s: &SessionSnapshot) {
        assert!(!s.countdown.is_counting_down);
        assert_eq!(s.countdown.remaining, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_ticks_lead_into_countdown() {
        let (session, _camera, model) = session(false);
        session.start_camera().await.unwrap();
        assert_eq!(session.snapshot().phase, CapturePhase::Scanning);

        advance(510).await;
        let s = session.snapshot();
        assert!(s.quality.no_face_hint);
        assert_eq!(s.phase, CapturePhase::Scanning);

        advance(500).await;
        assert!(session.snapshot().quality.no_face_hint);
        assert_eq!(session.snapshot().consecutive_detection_failures, 2);

        model.set(centered());
        advance(500).await;
        let s = session.snapshot();
        assert!(!s.quality.no_face_hint);
        assert_eq!(s.phase, CapturePhase::Countdown);
        assert!(s.countdown.is_counting_down);
        assert_eq!(s.countdown.remaining, 3);
        assert_eq!(s.consecutive_detection_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_completes_and_captures() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();

        advance(510).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Countdown);

        advance(1000).await;
        assert_eq!(session.snapshot().countdown.remaining, 2);

        advance(2100).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Captured);
        assert_countdown_reset(&s);
        assert!(!s.countdown.cancelled);
        assert!(!s.camera_active);
        assert!(!s.guide_visible);
        assert!(s.has_captured_image);
        assert!(!camera.is_live());

        let still = session.captured_image().unwrap();
        assert_eq!((still.width, still.height), (640, 640));
        assert_eq!(&still.jpeg[..2], &[0xFF, 0xD8]);

        // Nothing left running afterwards.
        advance(5000).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Captured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_face_lost_cancels_countdown() {
        let (session, _camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(1610).await;
        assert_eq!(session.snapshot().countdown.remaining, 2);

        model.set(None);
        advance(500).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert_countdown_reset(&s);
        assert!(s.countdown.cancelled);
        assert!(s.quality.no_face_hint);

        advance(1500).await;
        assert!(!session.snapshot().countdown.cancelled);
        assert!(!session.snapshot().has_captured_image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_guide_cancels_countdown() {
        let (session, _camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(1610).await;
        assert_eq!(session.snapshot().countdown.remaining, 2);

        model.set(Some(face_at(0.8, 0.5, 0.9)));
        advance(500).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert_countdown_reset(&s);
        assert!(s.countdown.cancelled);
        assert!(!s.quality.no_face_hint);

        advance(1500).await;
        let s = session.snapshot();
        assert!(!s.countdown.cancelled);
        assert_eq!(s.phase, CapturePhase::Scanning);

        // Back in position: a fresh countdown starts from 3.
        model.set(centered());
        advance(600).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Countdown);
        assert_eq!(s.countdown.remaining, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_errors_do_not_cancel_countdown() {
        let (session, _camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(610).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Countdown);

        model.fail(true);
        advance(3000).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Captured);
        assert!(!s.countdown.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_errors_never_start_countdown() {
        let (session, _camera, model) = session(false);
        model.set(centered());
        model.fail(true);
        session.start_camera().await.unwrap();

        advance(1510).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert!(s.quality.no_face_hint);
        assert_eq!(s.consecutive_detection_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_quality_blocks_countdown() {
        let (session, _camera, model) = session(false);
        model.set(Some(face_at(0.5, 0.5, 0.6)));
        session.start_camera().await.unwrap();

        advance(1510).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert!(s.quality.low_quality_warning);
        assert!(!s.countdown.is_counting_down);

        session.capture_now().unwrap();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Captured);
        assert!(s.has_captured_image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_face_is_low_quality() {
        let (session, _camera, model) = session(false);
        let mut tiny = face_at(0.5, 0.5, 0.95);
        tiny.bounding_box.width = 100.0;
        tiny.bounding_box.height = 100.0;
        model.set(Some(tiny));
        session.start_camera().await.unwrap();

        advance(510).await;
        assert!(session.snapshot().quality.low_quality_warning);
        assert_eq!(session.snapshot().phase, CapturePhase::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_returns_to_idle() {
        let (session, camera, _model) = session(true);
        let err = session.start_camera().await.unwrap_err();
        assert!(matches!(err, CaptureError::Camera(CameraError::PermissionDenied(_))));

        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert!(!s.camera_active);
        assert!(s.last_error.unwrap().contains("permission denied"));
        assert!(!camera.is_live());

        advance(2000).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_camera_mid_countdown() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(1110).await;
        assert!(session.snapshot().countdown.is_counting_down);

        session.stop_camera();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert_countdown_reset(&s);
        assert!(!camera.is_live());

        // Stale timers must not act after the stop.
        advance(5000).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert!(!s.has_captured_image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_auto_capture_is_safe_anywhere() {
        let (session, camera, model) = session(false);
        session.stop_auto_capture();
        session.stop_auto_capture();
        assert_eq!(session.snapshot().phase, CapturePhase::Idle);

        model.set(centered());
        session.start_camera().await.unwrap();
        advance(510).await;
        session.stop_auto_capture();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert_countdown_reset(&s);
        assert!(camera.is_live());

        advance(5000).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Idle);

        session.start_auto_capture();
        advance(510).await;
        assert_eq!(session.snapshot().phase, CapturePhase::Countdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_entry_is_not_reentrant() {
        let (session, _camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(1610).await;

        let mut m = session.machine();
        let epoch = m.epoch;
        assert!(!session.begin_countdown(&mut m));
        assert_eq!(m.epoch, epoch);
        assert_eq!(m.countdown.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retake_discards_photo() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(3600).await;
        assert!(session.snapshot().has_captured_image);

        session.retake().await.unwrap();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert!(!s.has_captured_image);
        assert!(camera.is_live());
        assert_eq!(camera.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let (session, camera, _model) = session(false);
        session.start_camera().await.unwrap();
        session.start_camera().await.unwrap();
        assert_eq!(camera.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_now_requires_live_session() {
        let (session, _camera, _model) = session(false);
        assert!(matches!(
            session.capture_now(),
            Err(CaptureError::NotCapturing(CapturePhase::Idle))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_resize_recomputes_guide() {
        let (session, _camera, _model) = session(false);
        session.start_camera().await.unwrap();
        assert_eq!(
            session.snapshot().guide,
            Some(GuideRegion::centered(DisplaySize::new(W as f32, H as f32)))
        );

        let display = DisplaySize::new(640.0, 360.0);
        session.set_display_size(display);
        assert_eq!(session.snapshot().guide, Some(GuideRegion::centered(display)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_transitions() {
        let (session, _camera, _model) = session(false);
        let mut rx = session.subscribe();
        session.start_camera().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().phase, CapturePhase::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_final_second_prevents_capture() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(2550).await;
        assert_eq!(session.snapshot().countdown.remaining, 1);

        // Monitor runs at 2600; the zero tick would land at 3500.
        model.set(None);
        advance(60).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert_countdown_reset(&s);
        assert!(s.countdown.cancelled);

        advance(1500).await;
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert!(!s.has_captured_image);
        assert!(camera.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_tick_after_cancel_is_ignored() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(2550).await;
        assert_eq!(session.snapshot().countdown.remaining, 1);

        // Cancellation and the last tick land together; the lock orders them.
        let epoch = session.machine().epoch;
        let lost = FrameCheck {
            detection: None,
            native: FrameSize::new(W, H),
            in_region: false,
            failures: 1,
            mode: PerformanceMode::High,
        };
        session.cancel_countdown(epoch, CancelReason::NoFace, &lost);
        assert!(!session.on_tick(epoch));

        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Scanning);
        assert_countdown_reset(&s);
        assert!(s.countdown.cancelled);
        assert!(!s.has_captured_image);
        assert!(session.captured_image().is_none());
        assert!(camera.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_auto_capture_while_camera_starting() {
        let (session, camera, _model) = slow_session();
        let starting = spawn_start(&session);
        advance(10).await;
        assert_eq!(session.snapshot().phase, CapturePhase::CameraStarting);

        session.stop_auto_capture();
        assert_eq!(session.snapshot().phase, CapturePhase::Idle);

        starting.await.unwrap().unwrap();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert!(!s.camera_active);
        assert!(!camera.is_live());

        advance(2000).await;
        session.start_camera().await.unwrap();
        assert_eq!(camera.starts(), 2);
        assert_eq!(session.snapshot().phase, CapturePhase::Scanning);
        assert!(camera.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_camera_while_camera_starting() {
        let (session, camera, _model) = slow_session();
        let starting = spawn_start(&session);
        advance(10).await;

        session.stop_camera();
        assert_eq!(session.snapshot().phase, CapturePhase::Idle);

        starting.await.unwrap().unwrap();
        let s = session.snapshot();
        assert_eq!(s.phase, CapturePhase::Idle);
        assert!(!s.camera_active);
        assert!(!camera.is_live());

        session.start_camera().await.unwrap();
        assert_eq!(session.snapshot().phase, CapturePhase::Scanning);
        assert!(camera.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_superseded_start_keeps_camera() {
        let (session, camera, _model) = slow_session();
        let first = spawn_start(&session);
        advance(10).await;
        session.stop_auto_capture();

        // A second start begins before the first acquisition resolves.
        let second = spawn_start(&session);
        advance(50).await;
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(session.snapshot().phase, CapturePhase::Scanning);
        assert!(camera.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_released_outside_machine_lock() {
        let (session, camera, model) = session(false);
        model.set(centered());
        session.start_camera().await.unwrap();
        advance(3600).await;
        assert!(session.snapshot().has_captured_image);

        session.retake().await.unwrap();
        session.capture_now().unwrap();
        session.start_camera().await.unwrap();
        session.stop_camera();
        session.reset().await;

        assert!(!camera.is_live());
        assert_eq!(camera.locked_stops(), 0);
    }
}
