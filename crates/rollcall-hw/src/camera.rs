//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameSource};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::{Capabilities, Flags as CapFlags};
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
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
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
    /// YUYV 4:2:2 packed (2 bytes/pixel, converted to RGB).
    Yuyv,
    /// 24-bit RGB, passed through.
    Rgb24,
    /// 24-bit BGR, channel-swapped to RGB.
    Bgr24,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            _ => None,
        }
    }
}

/// Exclusively owned V4L2 camera with a running capture stream.
///
/// Opening the camera acquires the device; dropping it stops streaming and
/// closes the device.
pub struct Camera {
    // Declared before `device` so the stream is torn down first.
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera by path (e.g. "/dev/video0") at the requested resolution.
    ///
    /// The driver may negotiate a different resolution; the negotiated one is
    /// reported in `width`/`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;
        let caps = capture_caps(&device)?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for YUYV (every UVC webcam offers it); accept packed RGB/BGR if the driver insists.
        let negotiated = device
            .format()
            .and_then(|mut fmt| {
                fmt.fourcc = FourCC::new(b"YUYV");
                fmt.width = width;
                fmt.height = height;
                device.set_format(&fmt)
            })
            .map_err(|e| CameraError::FormatNegotiationFailed(e.to_string()))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver chose {fourcc}; need YUYV, RGB3 or BGR3"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        Ok(Self {
            stream,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single frame, converted to packed RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let rgb = buf_to_rgb(self.pixel_format, buf, self.width, self.height)?;
        Frame::from_rgb(rgb, self.width, self.height, sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Capture-capable V4L2 nodes, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = v4l::context::enum_devices()
            .into_iter()
            .filter_map(|node| {
                let device = Device::with_path(node.path()).ok()?;
                let caps = capture_caps(&device).ok()?;
                Some(DeviceInfo {
                    path: node.path().display().to_string(),
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "releasing camera");
    }
}

const EBUSY: i32 = 16;

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(EBUSY) {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Query capabilities, rejecting nodes that cannot capture video.
fn capture_caps(device: &Device) -> Result<Capabilities, CameraError> {
    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("capability query: {e}")))?;
    if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        Ok(caps)
    } else {
        Err(CameraError::StreamingNotSupported)
    }
}

/// Convert a raw buffer to packed RGB based on the negotiated format.
fn buf_to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    let rgb_len = (width * height * 3) as usize;

    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            if buf.len() < rgb_len {
                return Err(CameraError::CaptureFailed(format!(
                    "{format:?} buffer too short: expected {rgb_len}, got {}",
                    buf.len()
                )));
            }
            let mut rgb = buf[..rgb_len].to_vec();
            if format == PixelFormat::Bgr24 {
                frame::bgr_to_rgb(&mut rgb);
            }
            Ok(rgb)
        }
    }
}
