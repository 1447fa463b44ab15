//! Face extraction: cascade detection, crop, resize, flatten.
//!
//! The detector runs on a grayscale copy of the frame. Each accepted region
//! is cropped from the colour frame, resized to `face_size × face_size` and
//! flattened to an RGB feature vector of `face_size² · 3` bytes.

use crate::types::{FaceCrop, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

// --- Detector defaults ---
const DEFAULT_MIN_FACE_SIZE: u32 = 40;
const DEFAULT_SCALE_STEP: f32 = 1.3;
const DEFAULT_SCORE_THRESHOLD: f64 = 2.0;
const DEFAULT_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector model not found: {0} (run `rollcall fetch-detector`)")]
    AssetMissing(String),
    #[error("detector model {path} is invalid: {reason}")]
    AssetInvalid { path: String, reason: String },
    #[error("frame buffer length mismatch: expected {expected}, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
}

/// Pluggable face detection backend.
///
/// Receives a row-major grayscale buffer of `width × height` bytes and
/// returns candidate face regions. Regions may extend past the frame edge;
/// the extractor clamps them.
pub trait FaceDetector {
    fn detect(&mut self, gray: &[u8], width: u32, height: u32)
        -> Result<Vec<FaceRegion>, ExtractError>;
}

/// Fixed tuning for the cascade detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Smallest face edge, in pixels, the detector will report.
    pub min_face_size: u32,
    /// Image pyramid step between scales (> 1.0; 1.3 means each level is 1/1.3 the size).
    pub scale_step: f32,
    /// Minimum cascade score for a window to count as a face.
    pub score_threshold: f64,
    /// Sliding window stride, in pixels, along both axes.
    pub window_step: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            scale_step: DEFAULT_SCALE_STEP,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            window_step: DEFAULT_WINDOW_STEP,
        }
    }
}

/// SeetaFace funnel-structured cascade detector (via `rustface`).
pub struct CascadeDetector {
    inner: Box<dyn rustface::Detector>,
}

impl CascadeDetector {
    /// Load the cascade model file and apply the detector parameters.
    ///
    /// Fails with [`ExtractError::AssetMissing`] when the file is absent so
    /// callers can refuse to start rather than run without detection.
    pub fn load(model_path: &Path, params: DetectorParams) -> Result<Self, ExtractError> {
        let path_str = model_path.to_string_lossy().into_owned();
        if !model_path.is_file() {
            return Err(ExtractError::AssetMissing(path_str));
        }

        let mut inner =
            rustface::create_detector(&path_str).map_err(|e| ExtractError::AssetInvalid {
                path: path_str.clone(),
                reason: e.to_string(),
            })?;

        let scale_step = if params.scale_step > 1.0 {
            params.scale_step
        } else {
            tracing::warn!(
                scale_step = params.scale_step,
                "scale step must exceed 1.0; using default"
            );
            DEFAULT_SCALE_STEP
        };

        inner.set_min_face_size(params.min_face_size.max(20));
        inner.set_pyramid_scale_factor(1.0 / scale_step);
        inner.set_score_thresh(params.score_threshold);
        inner.set_slide_window_step(params.window_step.max(1), params.window_step.max(1));

        tracing::info!(
            path = %path_str,
            min_face_size = params.min_face_size,
            scale_step,
            score_threshold = params.score_threshold,
            "loaded cascade detector"
        );

        Ok(Self { inner })
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceRegion>, ExtractError> {
        let expected = (width * height) as usize;
        if gray.len() != expected {
            return Err(ExtractError::InvalidFrame {
                expected,
                actual: gray.len(),
            });
        }

        let image = rustface::ImageData::new(gray, width, height);
        let faces = self.inner.detect(&image);

        Ok(faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                clamp_region(
                    bbox.x() as i64,
                    bbox.y() as i64,
                    bbox.width() as i64,
                    bbox.height() as i64,
                    width,
                    height,
                )
                .map(|mut region| {
                    region.score = face.score() as f32;
                    region
                })
            })
            .collect())
    }
}

/// Clip a signed rectangle to the frame; `None` if nothing is left.
fn clamp_region(x: i64, y: i64, w: i64, h: i64, frame_w: u32, frame_h: u32) -> Option<FaceRegion> {
    let x0 = x.clamp(0, frame_w as i64);
    let y0 = y.clamp(0, frame_h as i64);
    let x1 = (x + w).clamp(0, frame_w as i64);
    let y1 = (y + h).clamp(0, frame_h as i64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(FaceRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
        score: 0.0,
    })
}

/// Turns frames into fixed-length face feature vectors.
///
/// Stateless across frames: the output depends only on the frame passed in.
pub struct FaceExtractor {
    detector: Box<dyn FaceDetector>,
    face_size: u32,
}

impl FaceExtractor {
    pub fn new(detector: Box<dyn FaceDetector>, face_size: u32) -> Self {
        Self {
            detector,
            face_size: face_size.max(1),
        }
    }

    /// Length of every feature vector this extractor produces.
    pub fn feature_len(&self) -> usize {
        (self.face_size * self.face_size * 3) as usize
    }

    /// Detect faces in a packed RGB frame and return one crop per face.
    pub fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceCrop>, ExtractError> {
        let expected = (width * height * 3) as usize;
        if rgb.len() != expected {
            return Err(ExtractError::InvalidFrame {
                expected,
                actual: rgb.len(),
            });
        }
        let frame = RgbImage::from_raw(width, height, rgb.to_vec()).ok_or(
            ExtractError::InvalidFrame {
                expected,
                actual: rgb.len(),
            },
        )?;

        let gray = imageops::grayscale(&frame);
        let regions = self.detector.detect(gray.as_raw(), width, height)?;

        let mut crops = Vec::with_capacity(regions.len());
        for region in regions {
            let Some(clamped) = clamp_region(
                region.x as i64,
                region.y as i64,
                region.width as i64,
                region.height as i64,
                width,
                height,
            ) else {
                continue;
            };
            let clamped = FaceRegion {
                score: region.score,
                ..clamped
            };

            let crop = imageops::crop_imm(
                &frame,
                clamped.x,
                clamped.y,
                clamped.width,
                clamped.height,
            )
            .to_image();
            let resized = imageops::resize(&crop, self.face_size, self.face_size, FilterType::Triangle);

            crops.push(FaceCrop {
                region: clamped,
                features: resized.into_raw(),
            });
        }

        tracing::trace!(faces = crops.len(), "extracted faces");
        Ok(crops)
    }
}
