//! rollcall-hw — Camera capture for the attendance engine.
//!
//! Provides V4L2 camera access producing packed RGB frames, plus the
//! [`FrameSource`] seam the engine drives its loops through.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameSource};
