use rollcall_core::{ClassifierError, ExtractError, GalleryError, LedgerError};
use rollcall_hw::CameraError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::feedback::FeedbackError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face detector unavailable: {0}")]
    AssetMissing(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(#[from] CameraError),
    #[error("gallery is empty; enroll at least one face first")]
    EmptyGallery,
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid auto-stop policy: {0}")]
    InvalidPolicy(String),
    #[error("name must not be empty")]
    EmptyName,
    #[error("{operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("unusable frame: {0}")]
    InvalidFrame(String),
    #[error("feedback channel: {0}")]
    Feedback(#[from] FeedbackError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl From<ExtractError> for EngineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::AssetMissing(_) | ExtractError::AssetInvalid { .. } => {
                EngineError::AssetMissing(e.to_string())
            }
            ExtractError::InvalidFrame { .. } => EngineError::InvalidFrame(e.to_string()),
        }
    }
}

impl From<GalleryError> for EngineError {
    fn from(e: GalleryError) -> Self {
        match e {
            GalleryError::Io(io) => EngineError::Storage(format!("gallery: {io}")),
            GalleryError::Corrupt(msg) => EngineError::StoreCorrupt(msg),
            GalleryError::InvalidSample(s) => {
                EngineError::StoreCorrupt(format!("sample incompatible with stored gallery: {s}"))
            }
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Io(io) => EngineError::Storage(format!("ledger: {io}")),
            LedgerError::Corrupt { path, reason } => {
                EngineError::StoreCorrupt(format!("{path}: {reason}"))
            }
            LedgerError::EmptyName => EngineError::EmptyName,
        }
    }
}

impl From<ClassifierError> for EngineError {
    fn from(e: ClassifierError) -> Self {
        match e {
            ClassifierError::EmptyGallery => EngineError::EmptyGallery,
            other => EngineError::StoreCorrupt(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_errors_keep_their_kind() {
        let missing: EngineError = ExtractError::AssetMissing("/models/face.bin".into()).into();
        assert!(matches!(missing, EngineError::AssetMissing(_)));

        let invalid: EngineError = ExtractError::AssetInvalid {
            path: "/models/face.bin".into(),
            reason: "truncated".into(),
        }
        .into();
        assert!(matches!(invalid, EngineError::AssetMissing(_)));

        let frame: EngineError = ExtractError::InvalidFrame {
            expected: 48,
            actual: 10,
        }
        .into();
        assert!(matches!(frame, EngineError::InvalidFrame(_)));
    }

    #[test]
    fn test_store_errors_map_to_corrupt_or_storage() {
        let corrupt: EngineError = GalleryError::Corrupt("bad header".into()).into();
        assert!(matches!(corrupt, EngineError::StoreCorrupt(_)));

        let io: EngineError = LedgerError::Io(std::io::Error::other("disk full")).into();
        assert!(matches!(io, EngineError::Storage(_)));
    }
}
