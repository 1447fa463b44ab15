//! Frame type and pixel conversion from YUYV to packed RGB.

use crate::camera::CameraError;

/// A captured colour camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    /// Wrap a packed RGB buffer, checking its length against the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }
}

/// Anything that yields frames one at a time: a live camera, a replay, a test script.
///
/// Dropping the source releases the underlying device.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Convert packed YUYV (4:2:2) to packed RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

/// Swap the red and blue channels of a packed 24-bit buffer in place.
pub fn bgr_to_rgb(buf: &mut [u8]) {
    for px in buf.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_black_and_white() {
        // 2x1 image: black pixel then white pixel, neutral chroma
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_mid_gray() {
        let yuyv = vec![128, 128, 128, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![130; 6]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // Strong V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200, "red channel {}", rgb[0]);
        assert!(rgb[1] < 60, "green channel {}", rgb[1]);
    }

    #[test]
    fn test_yuyv_output_length() {
        let yuyv: Vec<u8> = (0..32).collect();
        let rgb = yuyv_to_rgb(&yuyv, 4, 4).unwrap();
        assert_eq!(rgb.len(), 4 * 4 * 3);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_bgr_swap() {
        let mut buf = vec![1, 2, 3, 4, 5, 6];
        bgr_to_rgb(&mut buf);
        assert_eq!(buf, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_from_rgb_checks_length() {
        assert!(Frame::from_rgb(vec![0; 12], 2, 2, 0).is_ok());
        assert!(Frame::from_rgb(vec![0; 11], 2, 2, 0).is_err());
    }

    #[test]
    fn test_from_rgb_keeps_sequence() {
        let frame = Frame::from_rgb(vec![9; 6], 2, 1, 41).unwrap();
        assert_eq!(frame.sequence, 41);
        assert_eq!((frame.width, frame.height), (2, 1));
    }
}
