use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Axis-aligned face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector score; scale depends on the detector backend.
    pub score: f32,
}

/// A detected face: its region plus the flattened canonical crop.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub region: FaceRegion,
    /// `face_size * face_size * 3` RGB bytes, row-major.
    pub features: Vec<u8>,
}

/// One labelled feature vector in the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceSample {
    pub label: String,
    pub features: Vec<u8>,
}

impl FaceSample {
    pub fn new(label: impl Into<String>, features: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            features,
        }
    }
}

/// Ordered, append-only collection of face samples.
///
/// All samples share one vector length and carry a non-empty label;
/// [`Gallery::push`] rejects anything that would break that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gallery {
    samples: Vec<FaceSample>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, enforcing the shared-length and non-empty-label rules.
    pub fn push(&mut self, sample: FaceSample) -> Result<(), InvalidSample> {
        if sample.label.trim().is_empty() {
            return Err(InvalidSample::EmptyLabel);
        }
        if sample.features.is_empty() {
            return Err(InvalidSample::EmptyVector);
        }
        if let Some(dim) = self.dim() {
            if sample.features.len() != dim {
                return Err(InvalidSample::LengthMismatch {
                    expected: dim,
                    actual: sample.features.len(),
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Feature vector length shared by every sample, `None` when empty.
    pub fn dim(&self) -> Option<usize> {
        self.samples.first().map(|s| s.features.len())
    }

    pub fn samples(&self) -> &[FaceSample] {
        &self.samples
    }

    pub fn distinct_labels(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|s| s.label.as_str()).collect()
    }

    /// Number of stored samples per label.
    pub fn label_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSample {
    #[error("sample label is empty")]
    EmptyLabel,
    #[error("sample feature vector is empty")]
    EmptyVector,
    #[error("feature length mismatch: gallery uses {expected}, sample has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// One row of a daily ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub time: NaiveTime,
}
