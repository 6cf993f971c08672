//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::io;
use std::path::Path;
use tempfile::TempPath;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const DARK_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("only dark frames after {0} attempts")]
    AllFramesDark(usize),
    #[error("still: {0}")]
    Still(#[from] FrameError),
}

impl CameraError {
    /// Errors a later capture attempt cannot recover from.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound(_)
                | Self::PermissionDenied(_)
                | Self::StreamingNotSupported
                | Self::FormatNegotiationFailed(_)
        )
    }
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
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale, replicated to RGB.
    Grey,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(device_path.to_string())
            }
            _ if e.raw_os_error() == Some(16) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
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

        // Ask for YUYV; accept GREY if that is all the driver offers.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    fn to_frame(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let rgb = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)?,
        };
        let is_dark = frame::is_dark_frame(&frame::rgb_luma(&rgb), DARK_THRESHOLD);
        Ok(Frame {
            data: rgb,
            width: self.width,
            height: self.height,
            sequence,
            is_dark,
        })
    }

    /// Capture a single RGB frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        self.to_frame(buf, meta.sequence)
    }

    /// Capture the first non-dark frame within `max_attempts` dequeues.
    pub fn capture_lit_frame(&self, max_attempts: usize) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        for _ in 0..max_attempts.max(1) {
            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;
            let frame = self.to_frame(buf, meta.sequence)?;
            if frame.is_dark {
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }
            return Ok(frame);
        }
        Err(CameraError::AllFramesDark(max_attempts.max(1)))
    }

    /// Capture a lit frame and write it as a temporary JPEG still under `dir`.
    pub fn capture_still(
        &self,
        dir: &Path,
        max_attempts: usize,
    ) -> Result<(TempPath, u32, u32), CameraError> {
        let frame = self.capture_lit_frame(max_attempts)?;
        let path = frame.write_still(dir)?;
        tracing::trace!(seq = frame.sequence, path = %path.display(), "wrote still");
        Ok((path, frame.width, frame.height))
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_transient_errors_are_recoverable() {
        assert!(!CameraError::DeviceBusy.is_unrecoverable());
        assert!(!CameraError::AllFramesDark(5).is_unrecoverable());
        assert!(!CameraError::CaptureFailed("EIO".into()).is_unrecoverable());
        assert!(CameraError::PermissionDenied("/dev/video0".into()).is_unrecoverable());
    }
}
