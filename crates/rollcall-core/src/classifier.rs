//! k-nearest-neighbour face classifier.
//!
//! Majority vote among the `k` gallery samples closest to the probe by
//! Euclidean distance over the flattened pixel vector. A tied vote goes to
//! whichever tied label owns the single nearest neighbour. There is no
//! rejection threshold: every probe gets a label.

use crate::types::Gallery;
use std::collections::HashMap;
use thiserror::Error;

/// Neighbour count used when the caller has no preference.
pub const DEFAULT_K: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("cannot train on an empty gallery")]
    EmptyGallery,
    #[error("probe has {actual} features, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Outcome of classifying one probe vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// Neighbours among the `k` nearest that voted for `label`.
    pub votes: usize,
    /// Effective `k` after clamping to the gallery size.
    pub k: usize,
    /// Euclidean distance to the nearest neighbour carrying `label`.
    pub distance: f32,
}

/// In-memory kNN model built from a full gallery snapshot.
pub struct KnnClassifier {
    labels: Vec<String>,
    vectors: Vec<Vec<u8>>,
    dim: usize,
    k: usize,
}

impl KnnClassifier {
    /// Build a model from every sample in the gallery.
    ///
    /// `k` is clamped to `1..=gallery.len()` so tiny galleries still vote.
    pub fn train(gallery: &Gallery, k: usize) -> Result<Self, ClassifierError> {
        let dim = gallery.dim().ok_or(ClassifierError::EmptyGallery)?;
        let effective_k = k.clamp(1, gallery.len());
        if effective_k != k {
            tracing::debug!(requested = k, effective = effective_k, "clamped k to gallery size");
        }

        let (labels, vectors) = gallery
            .samples()
            .iter()
            .map(|s| (s.label.clone(), s.features.clone()))
            .unzip();

        Ok(Self {
            labels,
            vectors,
            dim,
            k: effective_k,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of training samples.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Classify one feature vector.
    pub fn predict(&self, probe: &[u8]) -> Result<Prediction, ClassifierError> {
        if probe.len() != self.dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.dim,
                actual: probe.len(),
            });
        }

        // (squared distance, sample index), nearest first; index breaks exact ties.
        let mut neighbours: Vec<(u64, usize)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (squared_distance(probe, v), i))
            .collect();
        neighbours.sort_unstable();
        neighbours.truncate(self.k);

        let mut votes: HashMap<&str, usize> = HashMap::new();
        for &(_, idx) in &neighbours {
            *votes.entry(self.labels[idx].as_str()).or_insert(0) += 1;
        }
        let top = votes.values().copied().max().unwrap_or(0);

        // Walk nearest-first: the first label with the top count wins, which
        // resolves ties in favour of the closest single neighbour.
        let (dist_sq, idx) = neighbours
            .iter()
            .copied()
            .find(|&(_, idx)| votes[self.labels[idx].as_str()] == top)
            .ok_or(ClassifierError::EmptyGallery)?;

        Ok(Prediction {
            label: self.labels[idx].clone(),
            votes: top,
            k: self.k,
            distance: (dist_sq as f64).sqrt() as f32,
        })
    }
}

fn squared_distance(a: &[u8], b: &[u8]) -> u64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            (d * d) as u64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceSample;

    fn gallery(samples: &[(&str, [u8; 3])]) -> Gallery {
        let mut g = Gallery::new();
        for (label, v) in samples {
            g.push(FaceSample::new(*label, v.to_vec())).unwrap();
        }
        g
    }

    #[test]
    fn test_train_empty_gallery_fails() {
        let err = KnnClassifier::train(&Gallery::new(), DEFAULT_K).err();
        assert_eq!(err, Some(ClassifierError::EmptyGallery));
    }

    #[test]
    fn test_k_clamped_to_gallery_size() {
        let g = gallery(&[("alice", [10, 10, 10]), ("bob", [200, 200, 200])]);
        let model = KnnClassifier::train(&g, 5).unwrap();
        assert_eq!(model.k(), 2);

        let p = model.predict(&[12, 9, 11]).unwrap();
        assert_eq!(p.label, "alice");
        assert_eq!(p.k, 2);
    }

    #[test]
    fn test_single_sample_gallery_always_answers() {
        let g = gallery(&[("solo", [0, 0, 0])]);
        let model = KnnClassifier::train(&g, DEFAULT_K).unwrap();
        assert_eq!(model.predict(&[255, 255, 255]).unwrap().label, "solo");
    }

    #[test]
    fn test_majority_vote_beats_nearest() {
        // Nearest sample is "bob", but alice holds 3 of the 5 nearest.
        let g = gallery(&[
            ("bob", [50, 50, 50]),
            ("alice", [54, 54, 54]),
            ("alice", [55, 55, 55]),
            ("alice", [56, 56, 56]),
            ("bob", [58, 58, 58]),
            ("bob", [250, 250, 250]),
        ]);
        let model = KnnClassifier::train(&g, 5).unwrap();
        let p = model.predict(&[50, 50, 50]).unwrap();
        assert_eq!(p.label, "alice");
        assert_eq!(p.votes, 3);
    }

    #[test]
    fn test_tie_goes_to_nearest_neighbour() {
        // k=4: two votes each; carol owns the closest sample.
        let g = gallery(&[
            ("dave", [20, 20, 20]),
            ("carol", [11, 11, 11]),
            ("dave", [21, 21, 21]),
            ("carol", [30, 30, 30]),
        ]);
        let model = KnnClassifier::train(&g, 4).unwrap();
        let p = model.predict(&[10, 10, 10]).unwrap();
        assert_eq!(p.label, "carol");
        assert_eq!(p.votes, 2);
        assert!((p.distance - 3f32.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_dimension_mismatch() {
        let g = gallery(&[("alice", [1, 2, 3])]);
        let model = KnnClassifier::train(&g, 1).unwrap();
        assert_eq!(
            model.predict(&[1, 2]).unwrap_err(),
            ClassifierError::DimensionMismatch { expected: 3, actual: 2 }
        );
    }
}
