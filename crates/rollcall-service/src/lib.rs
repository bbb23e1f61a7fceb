//! rollcall-service: The live pipeline around the stores.
//!
//! Composes locator and encoder into a [`RecognitionService`], gates results
//! into attendance events, and runs the camera and enrollment threads.

pub mod bootstrap;
pub mod camera_loop;
pub mod enrollment;
pub mod gate;
pub mod recognition;

pub use bootstrap::{Degraded, ServiceError, Startup};
pub use camera_loop::{AttendanceMode, CameraLoop, LoopEvent, LoopSettings, StopReason, Toast, ToastLevel};
pub use enrollment::{CaptureSession, CaptureSettings, DuplicateCheck, EnrollError, EnrollmentRequest};
pub use gate::{AttendanceGate, GateDecision};
pub use recognition::{RecognitionMode, RecognitionService, RecognitionSettings, RecognitionStats};
