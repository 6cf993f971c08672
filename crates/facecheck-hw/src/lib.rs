//! facecheck-hw: V4L2 camera capture for the check-in daemon.
//!
//! Opens a capture device, converts YUYV/GREY frames to RGB, skips dark
//! frames and writes stills as temporary JPEG files.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
