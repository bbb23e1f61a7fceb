//! V4L2 camera capture via the `v4l` crate.
//!
//! A device is owned by at most one [`Camera`] per process at a time; the
//! ownership is released when the camera is dropped.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Anything that yields RGB frames one at a time.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    /// Frame size `(width, height)`.
    fn resolution(&self) -> (u32, u32);
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else {
            None
        }
    }
}

/// `/dev/video<index>` for a numeric camera id.
pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

fn open_devices() -> &'static Mutex<HashSet<String>> {
    static OPEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// In-process claim on a device path. Dropping it releases the claim.
#[derive(Debug)]
pub struct DeviceLease {
    path: String,
}

impl DeviceLease {
    pub fn acquire(path: &str) -> Result<Self, CameraError> {
        let mut open = open_devices()
            .lock()
            .map_err(|_| CameraError::CaptureFailed("device registry lock poisoned".into()))?;
        if !open.insert(path.to_string()) {
            return Err(CameraError::DeviceBusy(path.to_string()));
        }
        tracing::debug!(device = path, "device claimed");
        Ok(Self { path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut open) = open_devices().lock() {
            open.remove(&self.path);
        }
        tracing::debug!(device = %self.path, "device released");
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    // Declared before `device` so streaming stops before the fd closes.
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    lease: DeviceLease,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// `width` × `height`. The driver may negotiate a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let lease = DeviceLease::acquire(device_path)?;

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

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
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            fourcc,
            pixel_format,
            lease,
        })
    }

    /// Open `/dev/video<index>`.
    pub fn open_index(index: u32, width: u32, height: u32) -> Result<Self, CameraError> {
        Self::open(&device_path(index), width, height)
    }

    pub fn device_path(&self) -> &str {
        self.lease.path()
    }

    /// Convert a raw buffer to RGB based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream unavailable".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let buf = if used > 0 { &buf[..used] } else { buf };
        let sequence = meta.sequence;
        let owned = buf.to_vec();

        let image = self.buf_to_rgb(&owned)?;
        Ok(Frame::new(image, sequence))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stream = None;
        tracing::info!(device = %self.lease.path(), "camera released");
    }
}
