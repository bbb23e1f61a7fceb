//! rollcall-hw: Camera capture.
//!
//! Provides V4L2-based camera access producing RGB frames, with in-process
//! exclusive ownership of each capture device.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceLease, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
