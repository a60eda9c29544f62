//! Camera → detect → capture → submit → outcome cycle.
//!
//! [`CaptureMachine`] holds every transition and guard and takes the current time as an
//! argument. [`CaptureController`] drives it on tokio timers: a fast detection tick, a
//! slower auto-capture evaluation, the in-flight backend request and operator commands.

use crate::camera::{CameraConstraints, CameraProvider, CameraSession};
use crate::common::config::CaptureConfig;
use crate::common::{AttendanceError, DevMode, Result};
use crate::core::detector::{DetectorMode, FaceDetector, PresenceSignal};
use crate::core::outcome::RecognitionOutcome;
use crate::core::overlay;
use crate::service::protocol::{RegistrationResponse, StudentRegistration};
use async_trait::async_trait;
use futures::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Unreadable frames in a row before the stream counts as lost.
const MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 30;

#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Never fails: transport and backend errors come back as [`RecognitionOutcome::Failed`].
    async fn recognize(&self, image: Vec<u8>) -> RecognitionOutcome;
    async fn register(&self, student: &StudentRegistration, image: Vec<u8>) -> Result<RegistrationResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Initializing,
    Ready,
    AutoScanning,
    ManualReady,
    Capturing,
    Submitting,
    Success,
    Unmatched,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Auto,
    Manual,
}

impl CaptureSource {
    fn label(&self) -> &'static str {
        match self {
            CaptureSource::Auto => "auto",
            CaptureSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureAttempt {
    pub triggered_at: Instant,
    pub source: CaptureSource,
    pub image_jpeg: Vec<u8>,
}

/// Unknown face waiting for the operator to register or dismiss it.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub image_jpeg: Vec<u8>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    PhaseChanged(CapturePhase),
    /// Only emitted when preview is enabled.
    Frame { frame: Arc<DynamicImage>, signal: PresenceSignal },
    Submitted { source: CaptureSource },
    Recognized { student_id: String, student_name: String },
    RegistrationOffered { message: String },
    Registered { student_id: String, message: String },
    Notification(String),
    Fatal(String),
    Closed,
}

pub struct CaptureMachine {
    config: CaptureConfig,
    detector: FaceDetector,
    camera: Option<CameraSession>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    dev: DevMode,
    phase: CapturePhase,
    auto_capture: bool,
    preview: bool,
    in_flight: bool,
    attempt: Option<CaptureAttempt>,
    last_capture_at: Option<Instant>,
    success_until: Option<Instant>,
    pending: Option<PendingRegistration>,
    frame: Option<Arc<DynamicImage>>,
    signal: Option<PresenceSignal>,
    fatal_error: Option<String>,
    frame_errors: u32,
}

impl CaptureMachine {
    pub fn new(
        config: CaptureConfig,
        detector: FaceDetector,
        dev: DevMode,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            auto_capture: config.auto_capture,
            config,
            detector,
            camera: None,
            events,
            dev,
            phase: CapturePhase::Initializing,
            preview: false,
            in_flight: false,
            attempt: None,
            last_capture_at: None,
            success_until: None,
            pending: None,
            frame: None,
            signal: None,
            fatal_error: None,
            frame_errors: 0,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == CapturePhase::Closed
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    pub fn set_preview(&mut self, enabled: bool) {
        self.preview = enabled;
    }

    fn emit(&self, event: CaptureEvent) {
        // Nobody listening is fine; the machine keeps working headless.
        let _ = self.events.send(event);
    }

    fn set_phase(&mut self, phase: CapturePhase) {
        if self.phase != phase {
            tracing::debug!("Capture phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            self.emit(CaptureEvent::PhaseChanged(phase));
        }
    }

    fn cooldown(&self) -> Duration {
        match self.detector.mode() {
            DetectorMode::Cascade => Duration::from_millis(self.config.cascade_cooldown_ms),
            DetectorMode::Heuristic => Duration::from_millis(self.config.heuristic_cooldown_ms),
        }
    }

    /// Acquires the camera. Denial is fatal for this session: the error is reported,
    /// the machine tears down to `Closed` and nothing retries on its own.
    pub fn start(&mut self, provider: &dyn CameraProvider, constraints: &CameraConstraints) -> Result<()> {
        if self.camera.is_some() {
            return Ok(());
        }

        self.fatal_error = None;
        self.frame_errors = 0;
        self.set_phase(CapturePhase::Initializing);

        match provider.acquire(constraints) {
            Ok(source) => {
                self.camera = Some(CameraSession::new(source));
                tracing::info!("Capture started in {} mode", self.detector.mode());
                self.set_phase(CapturePhase::Ready);
                self.resume_scanning();
                Ok(())
            }
            Err(e) => {
                self.fail(format!("Camera unavailable: {}", e.user_message()));
                Err(e)
            }
        }
    }

    fn fail(&mut self, message: String) {
        tracing::error!("Capture session failed: {}", message);
        self.fatal_error = Some(message.clone());
        self.emit(CaptureEvent::Fatal(message));
        self.close();
    }

    fn resume_scanning(&mut self) {
        if self.camera.is_none() {
            return;
        }
        self.success_until = None;
        let phase = if self.auto_capture { CapturePhase::AutoScanning } else { CapturePhase::ManualReady };
        self.set_phase(phase);
    }

    /// One detection pass over the current frame.
    ///
    /// An unreadable frame skips the tick and presence decays through the grace
    /// window; only a run of failures ends the session.
    pub fn tick(&mut self, now: Instant) -> Option<PresenceSignal> {
        let camera = self.camera.as_mut()?;
        let frame = match camera.current_frame() {
            Ok(frame) => {
                self.frame_errors = 0;
                frame
            }
            Err(e) => {
                self.frame_errors += 1;
                if self.frame_errors >= MAX_CONSECUTIVE_FRAME_ERRORS {
                    self.fail(format!("Camera stopped delivering frames: {}", e.user_message()));
                } else {
                    tracing::debug!(
                        "Skipping unreadable frame ({}/{}): {}",
                        self.frame_errors, MAX_CONSECUTIVE_FRAME_ERRORS, e
                    );
                }
                return None;
            }
        };

        if self.phase == CapturePhase::Success && self.success_until.map_or(false, |until| now >= until) {
            self.resume_scanning();
        }

        let signal = self.detector.detect(&frame, now);
        let frame = Arc::new(frame);
        if self.preview {
            self.emit(CaptureEvent::Frame { frame: frame.clone(), signal: signal.clone() });
        }
        self.frame = Some(frame);
        self.signal = Some(signal.clone());
        Some(signal)
    }

    pub fn should_auto_capture(&self, now: Instant) -> bool {
        self.auto_capture
            && self.phase == CapturePhase::AutoScanning
            && !self.in_flight
            && self.pending.is_none()
            && self.frame.is_some()
            && self.detector.is_present_at(now)
            && self.last_capture_at
                .map_or(true, |last| now.saturating_duration_since(last) > self.cooldown())
    }

    /// Single-flight: returns the JPEG to submit, or `None` when a capture is already
    /// in flight or the controller is not scanning.
    pub fn begin_capture(&mut self, source: CaptureSource, now: Instant) -> Option<Vec<u8>> {
        if self.in_flight {
            tracing::debug!("Capture in flight, ignoring {} trigger", source.label());
            return None;
        }
        if !matches!(self.phase, CapturePhase::AutoScanning | CapturePhase::ManualReady) {
            tracing::debug!("Not scanning ({:?}), ignoring {} trigger", self.phase, source.label());
            return None;
        }
        let frame = self.frame.clone()?;

        self.set_phase(CapturePhase::Capturing);
        let image = match encode_jpeg(&frame, self.config.jpeg_quality) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Failed to encode capture: {}", e);
                self.emit(CaptureEvent::Notification(format!("Could not capture frame: {}", e.user_message())));
                self.resume_scanning();
                return None;
            }
        };

        self.in_flight = true;
        self.last_capture_at = Some(now);
        self.save_dev_artifacts(source, &frame, &image);
        self.attempt = Some(CaptureAttempt { triggered_at: now, source, image_jpeg: image.clone() });
        self.set_phase(CapturePhase::Submitting);
        self.emit(CaptureEvent::Submitted { source });
        Some(image)
    }

    pub fn finish_capture(&mut self, outcome: RecognitionOutcome, now: Instant) {
        self.in_flight = false;
        let attempt = self.attempt.take();

        if self.is_closed() {
            tracing::debug!("Discarding recognition outcome after close: {:?}", outcome);
            return;
        }

        if let Some(attempt) = &attempt {
            tracing::debug!(
                "{} capture resolved after {:?}",
                attempt.source.label(),
                now.saturating_duration_since(attempt.triggered_at)
            );
        }

        match outcome {
            RecognitionOutcome::Matched { student_id, student_name } => {
                tracing::info!("Attendance marked for {} ({})", student_name, student_id);
                self.success_until = Some(now + self.config.success_overlay());
                self.set_phase(CapturePhase::Success);
                self.emit(CaptureEvent::Recognized { student_id, student_name });
            }
            RecognitionOutcome::Unmatched { message } => match attempt {
                Some(attempt) => {
                    tracing::info!("Unknown face: {}", message);
                    self.pending = Some(PendingRegistration { image_jpeg: attempt.image_jpeg, message: message.clone() });
                    self.set_phase(CapturePhase::Unmatched);
                    self.emit(CaptureEvent::RegistrationOffered { message });
                }
                None => {
                    self.emit(CaptureEvent::Notification(message));
                    self.resume_scanning();
                }
            },
            RecognitionOutcome::Failed(reason) => {
                tracing::warn!("Recognition failed: {}", reason);
                self.set_phase(CapturePhase::Error);
                self.emit(CaptureEvent::Notification(reason));
                self.resume_scanning();
            }
        }
    }

    /// Image of the pending unknown face, marking the registration request as in flight.
    pub fn begin_registration(&mut self) -> Option<Vec<u8>> {
        if self.in_flight || self.is_closed() {
            return None;
        }
        let image = self.pending.as_ref()?.image_jpeg.clone();
        self.in_flight = true;
        Some(image)
    }

    /// On failure the offer stays open so the operator can retry or dismiss.
    pub fn finish_registration(&mut self, result: Result<RegistrationResponse>) {
        self.in_flight = false;
        if self.is_closed() {
            return;
        }

        match result {
            Ok(response) => {
                tracing::info!("Registered student {:?}", response.student_id);
                self.pending = None;
                self.emit(CaptureEvent::Registered {
                    student_id: response.student_id.unwrap_or_default(),
                    message: response.message,
                });
                self.resume_scanning();
            }
            Err(e) => {
                tracing::warn!("Registration failed: {}", e);
                self.emit(CaptureEvent::Notification(format!("Registration failed: {}", e.user_message())));
            }
        }
    }

    pub fn dismiss_registration(&mut self) {
        if self.in_flight {
            return;
        }
        if self.pending.take().is_some() {
            self.resume_scanning();
        }
    }

    pub fn set_auto_capture(&mut self, enabled: bool) {
        self.auto_capture = enabled;
        if matches!(self.phase, CapturePhase::Ready | CapturePhase::AutoScanning | CapturePhase::ManualReady) {
            self.resume_scanning();
        }
    }

    /// Stops detection and releases the camera. Returns `true` only for the call that tore down.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }

        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        self.frame = None;
        self.signal = None;
        self.pending = None;
        self.success_until = None;
        self.set_phase(CapturePhase::Closed);
        self.emit(CaptureEvent::Closed);
        true
    }

    fn save_dev_artifacts(&self, source: CaptureSource, frame: &DynamicImage, jpeg: &[u8]) {
        if !self.dev.is_enabled() {
            return;
        }

        self.dev.save_capture(source.label(), jpeg);
        if let (Some(signal), Some(path)) = (&self.signal, self.dev.debug_path(source.label())) {
            if let Err(e) = overlay::annotate(frame, signal).save(&path) {
                tracing::warn!("Failed to save debug frame {:?}: {}", path, e);
            }
        }
    }
}

pub fn encode_jpeg(frame: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = frame.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
    Ok(out)
}

#[derive(Debug, Clone)]
pub enum CaptureCommand {
    Capture,
    Register(StudentRegistration),
    DismissRegistration,
    SetAutoCapture(bool),
    Close,
}

/// Cloneable remote for a running [`CaptureController`].
#[derive(Clone)]
pub struct CaptureHandle {
    commands: mpsc::UnboundedSender<CaptureCommand>,
}

impl CaptureHandle {
    fn send(&self, command: CaptureCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Capture controller already stopped");
        }
    }

    pub fn capture(&self) {
        self.send(CaptureCommand::Capture);
    }

    pub fn register_pending(&self, student: StudentRegistration) {
        self.send(CaptureCommand::Register(student));
    }

    pub fn dismiss_registration(&self) {
        self.send(CaptureCommand::DismissRegistration);
    }

    pub fn set_auto_capture(&self, enabled: bool) {
        self.send(CaptureCommand::SetAutoCapture(enabled));
    }

    pub fn close(&self) {
        self.send(CaptureCommand::Close);
    }
}

enum Flight {
    Recognition(RecognitionOutcome),
    Registration(Result<RegistrationResponse>),
}

async fn poll_flight(flight: &mut Option<BoxFuture<'static, Flight>>) -> Flight {
    match flight {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub struct CaptureController {
    machine: CaptureMachine,
    backend: Arc<dyn RecognitionBackend>,
    provider: Box<dyn CameraProvider>,
    constraints: CameraConstraints,
    commands: mpsc::UnboundedReceiver<CaptureCommand>,
    tick_interval: Duration,
    evaluation_interval: Duration,
}

impl CaptureController {
    pub fn new(
        config: &CaptureConfig,
        constraints: CameraConstraints,
        detector: FaceDetector,
        provider: Box<dyn CameraProvider>,
        backend: Arc<dyn RecognitionBackend>,
        dev: DevMode,
    ) -> (Self, CaptureHandle, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let controller = Self {
            machine: CaptureMachine::new(config.clone(), detector, dev, event_tx),
            backend,
            provider,
            constraints,
            commands: command_rx,
            tick_interval: config.tick_interval(),
            evaluation_interval: config.evaluation_interval(),
        };
        (controller, CaptureHandle { commands: command_tx }, event_rx)
    }

    pub fn with_preview(mut self, enabled: bool) -> Self {
        self.machine.set_preview(enabled);
        self
    }

    /// Runs until closed. An in-flight request is awaited after close and its outcome dropped.
    pub async fn run(mut self) -> Result<()> {
        self.machine.start(self.provider.as_ref(), &self.constraints)?;

        let mut tick = time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut evaluation = time::interval(self.evaluation_interval);
        evaluation.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut flight: Option<BoxFuture<'static, Flight>> = None;
        let mut commands_open = true;

        loop {
            let closed = self.machine.is_closed();
            if closed && flight.is_none() {
                break;
            }

            tokio::select! {
                _ = tick.tick(), if !closed => {
                    self.machine.tick(Instant::now());
                }
                _ = evaluation.tick(), if !closed => {
                    let now = Instant::now();
                    if self.machine.should_auto_capture(now) {
                        if let Some(image) = self.machine.begin_capture(CaptureSource::Auto, now) {
                            flight = Some(self.recognize(image));
                        }
                    }
                }
                done = poll_flight(&mut flight), if flight.is_some() => {
                    flight = None;
                    match done {
                        Flight::Recognition(outcome) => self.machine.finish_capture(outcome, Instant::now()),
                        Flight::Registration(result) => self.machine.finish_registration(result),
                    }
                }
                command = self.commands.recv(), if commands_open && !closed => match command {
                    Some(command) => {
                        if let Some(started) = self.apply(command) {
                            flight = Some(started);
                        }
                    }
                    None => {
                        commands_open = false;
                        self.machine.close();
                    }
                },
                else => break,
            }
        }

        match self.machine.fatal_error() {
            Some(message) => Err(AttendanceError::Camera(message.to_string())),
            None => Ok(()),
        }
    }

    fn recognize(&self, image: Vec<u8>) -> BoxFuture<'static, Flight> {
        let backend = self.backend.clone();
        Box::pin(async move { Flight::Recognition(backend.recognize(image).await) })
    }

    fn apply(&mut self, command: CaptureCommand) -> Option<BoxFuture<'static, Flight>> {
        match command {
            CaptureCommand::Capture => self.machine
                .begin_capture(CaptureSource::Manual, Instant::now())
                .map(|image| self.recognize(image)),
            CaptureCommand::Register(student) => {
                let image = self.machine.begin_registration()?;
                let backend = self.backend.clone();
                Some(Box::pin(async move { Flight::Registration(backend.register(&student, image).await) }))
            }
            CaptureCommand::DismissRegistration => {
                self.machine.dismiss_registration();
                None
            }
            CaptureCommand::SetAutoCapture(enabled) => {
                self.machine.set_auto_capture(enabled);
                None
            }
            CaptureCommand::Close => {
                self.machine.close();
                None
            }
        }
    }
}
