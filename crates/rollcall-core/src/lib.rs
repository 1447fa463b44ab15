//! rollcall-core — Face extraction, classification and durable stores.
//!
//! Detects faces with a SeetaFace funnel cascade, flattens fixed-size RGB
//! crops into feature vectors, classifies them with k-nearest-neighbour
//! voting, and persists the labelled gallery and the daily attendance ledger.

pub mod classifier;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod types;

pub use classifier::{ClassifierError, KnnClassifier, Prediction};
pub use extractor::{CascadeDetector, DetectorParams, ExtractError, FaceDetector, FaceExtractor};
pub use gallery::{GalleryError, GalleryStore};
pub use ledger::{date_key, parse_date_key, LedgerBook, LedgerError, RecordOutcome};
pub use types::{AttendanceRecord, FaceCrop, FaceRegion, FaceSample, Gallery, InvalidSample};
