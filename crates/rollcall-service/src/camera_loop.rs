//! Live attendance: a dedicated thread reads frames, runs recognition, gates
//! results and records check-ins or check-outs.
//!
//! The thread owns the frame source and releases it on exit. It is stopped by
//! flipping a shared flag, observed once per loop iteration.

use crate::gate::{AttendanceGate, GateDecision};
use crate::recognition::RecognitionService;
use image::RgbImage;
use rollcall_core::RecognitionResult;
use rollcall_hw::FrameSource;
use rollcall_store::{AttendanceEngine, CheckInOutcome, CheckOutOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Slots `Frame` events leave free for toasts and the final `Stopped`.
const FRAME_HEADROOM: usize = 8;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("failed to spawn camera thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("camera thread panicked")]
    Panicked,
}

/// Event kind written for every person that passes the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceMode {
    CheckIn,
    CheckOut,
}

impl AttendanceMode {
    fn label(self) -> &'static str {
        match self {
            Self::CheckIn => "Check In",
            Self::CheckOut => "Check Out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    fn new(level: ToastLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// Frame read failed; the device is treated as dead.
    DeviceError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// Overlay data for one frame.
    Frame {
        sequence: u32,
        results: Vec<RecognitionResult>,
    },
    Toast(Toast),
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub frames: u64,
    pub events_recorded: u64,
    pub reason: StopReason,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub mode: AttendanceMode,
    /// 0 disables rate limiting.
    pub target_fps: u32,
    /// Attach the full frame as photo evidence.
    pub save_photos: bool,
}

/// Handle to a running camera thread.
pub struct CameraLoop {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<LoopSummary>>,
    events: mpsc::Receiver<LoopEvent>,
}

impl CameraLoop {
    pub fn spawn<S: FrameSource + 'static>(
        source: S,
        service: RecognitionService,
        gate: AttendanceGate,
        attendance: Arc<Mutex<AttendanceEngine>>,
        settings: LoopSettings,
    ) -> Result<Self, LoopError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let worker = Worker {
            source,
            service,
            gate,
            attendance,
            settings,
            events: tx,
            stop: Arc::clone(&stop),
            frames: 0,
            recorded: 0,
        };
        let thread = std::thread::Builder::new()
            .name("rollcall-camera".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            stop,
            thread: Some(thread),
            events,
        })
    }

    /// Shared stop flag, for wiring to signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn next_event(&mut self) -> Option<LoopEvent> {
        self.events.recv().await
    }

    /// Signal the thread and wait for it to release the camera.
    pub fn stop(mut self) -> Result<LoopSummary, LoopError> {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    fn join(&mut self) -> Result<LoopSummary, LoopError> {
        self.events.close();
        let thread = self.thread.take().ok_or(LoopError::Panicked)?;
        thread.join().map_err(|_| LoopError::Panicked)
    }
}

impl Drop for CameraLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.store(true, Ordering::SeqCst);
            let _ = self.join();
        }
    }
}

struct Worker<S> {
    source: S,
    service: RecognitionService,
    gate: AttendanceGate,
    attendance: Arc<Mutex<AttendanceEngine>>,
    settings: LoopSettings,
    events: mpsc::Sender<LoopEvent>,
    stop: Arc<AtomicBool>,
    frames: u64,
    recorded: u64,
}

impl<S: FrameSource> Worker<S> {
    fn run(mut self) -> LoopSummary {
        let (width, height) = self.source.resolution();
        tracing::info!(width, height, mode = ?self.settings.mode, "camera loop started");
        let frame_budget = (self.settings.target_fps > 0)
            .then(|| Duration::from_secs_f64(1.0 / f64::from(self.settings.target_fps)));

        let reason = loop {
            if self.stop.load(Ordering::SeqCst) {
                break StopReason::Cancelled;
            }
            let started = Instant::now();
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "frame read failed, stopping camera loop");
                    self.emit(LoopEvent::Toast(Toast::new(ToastLevel::Error, format!("Camera error: {e}"))));
                    break StopReason::DeviceError(e.to_string());
                }
            };
            self.frames += 1;
            self.process(frame.sequence, &frame.image);

            if let Some(budget) = frame_budget {
                let spent = started.elapsed();
                if spent < budget {
                    std::thread::sleep(budget - spent);
                }
            }
        };

        self.emit(LoopEvent::Stopped(reason.clone()));
        tracing::info!(frames = self.frames, recorded = self.recorded, reason = ?reason, "camera loop exiting");
        LoopSummary {
            frames: self.frames,
            events_recorded: self.recorded,
            reason,
        }
    }

    fn process(&mut self, sequence: u32, image: &RgbImage) {
        let outcome = self.service.process_frame(image);
        if outcome.fresh {
            let now = Instant::now();
            for result in &outcome.results {
                match self.gate.evaluate(result, now) {
                    GateDecision::Pass => self.mark(result, image),
                    decision => tracing::trace!(name = %result.name, ?decision, "gated"),
                }
            }
        }
        self.emit_frame(LoopEvent::Frame {
            sequence,
            results: outcome.results,
        });
    }

    fn mark(&mut self, result: &RecognitionResult, image: &RgbImage) {
        let Ok(mut engine) = self.attendance.lock() else {
            tracing::error!("attendance engine lock poisoned");
            return;
        };
        let photo = self.settings.save_photos.then_some(image);
        let name = result.name.as_str();
        let mode = self.settings.mode;

        let toast = match mode {
            AttendanceMode::CheckIn => match engine.check_in(name, result.confidence, photo) {
                Ok(CheckInOutcome::Recorded(_)) => Some(ToastLevel::Success),
                Ok(CheckInOutcome::AlreadyCheckedIn { time, .. }) => {
                    self.emit_toast(ToastLevel::Warning, format!("{name} already checked in at {time}"));
                    None
                }
                Err(e) => {
                    self.emit_toast(ToastLevel::Error, format!("Failed to record {name}: {e}"));
                    None
                }
            },
            AttendanceMode::CheckOut => match engine.check_out(name, result.confidence, photo) {
                Ok(CheckOutOutcome::Recorded(_)) => Some(ToastLevel::Success),
                Ok(CheckOutOutcome::NotCheckedIn) => {
                    self.emit_toast(ToastLevel::Warning, format!("{name} has not checked in today"));
                    None
                }
                Ok(CheckOutOutcome::AlreadyCheckedOut { time }) => {
                    self.emit_toast(ToastLevel::Warning, format!("{name} already checked out at {time}"));
                    None
                }
                Err(e) => {
                    self.emit_toast(ToastLevel::Error, format!("Failed to record {name}: {e}"));
                    None
                }
            },
        };
        drop(engine);

        if let Some(level) = toast {
            self.recorded += 1;
            self.emit_toast(level, format!("{name} - {}", mode.label()));
        }
    }

    fn emit_toast(&self, level: ToastLevel, message: String) {
        match level {
            ToastLevel::Success => tracing::info!(%message, "attendance"),
            ToastLevel::Warning => tracing::warn!(%message, "attendance"),
            ToastLevel::Error => tracing::error!(%message, "attendance"),
        }
        self.emit(LoopEvent::Toast(Toast::new(level, message)));
    }

    /// Overlay updates are disposable: dropped when the consumer lags.
    fn emit_frame(&self, event: LoopEvent) {
        if self.events.capacity() <= FRAME_HEADROOM {
            tracing::trace!("consumer behind, dropping frame event");
            return;
        }
        let _ = self.events.try_send(event);
    }

    /// Toasts and `Stopped` are always delivered; waits for the consumer when
    /// the channel is full. Fails only once the receiver is closed.
    fn emit(&self, event: LoopEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events.blocking_send(event) {
            tracing::debug!(?event, "event receiver closed");
        }
    }
}
