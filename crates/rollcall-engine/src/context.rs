//! Process-wide application context.
//!
//! Built once at startup and passed by reference into every controller
//! call. Owns the durable stores, the face extractor, the feedback handle
//! and the clock; nothing here is global.

use rollcall_core::{CascadeDetector, FaceExtractor, GalleryStore, LedgerBook};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::EngineError;
use crate::feedback::{LogSink, Notifier, SpeechSink};

pub struct AppContext {
    pub config: Config,
    pub gallery: GalleryStore,
    pub ledger: LedgerBook,
    pub extractor: FaceExtractor,
    pub notifier: Notifier,
    pub clock: Arc<dyn Clock>,
}

impl AppContext {
    /// Open the stores, load the cascade detector and start the feedback thread.
    ///
    /// A missing or unreadable detector model fails here with
    /// [`EngineError::AssetMissing`]; nothing runs without detection.
    pub fn initialize(config: Config) -> Result<Self, EngineError> {
        let model_path = config.detector_model_path();
        let detector = CascadeDetector::load(&model_path, config.detector_params())?;
        let extractor = FaceExtractor::new(Box::new(detector), config.face_size);

        let notifier = match SpeechSink::from_command_line(&config.feedback.speech_command) {
            Some(sink) => Notifier::spawn(Box::new(sink), config.feedback.queue_depth)?,
            None => Notifier::spawn(Box::new(LogSink), config.feedback.queue_depth)?,
        };

        Self::new(config, extractor, notifier, Arc::new(SystemClock))
    }

    /// Assemble a context from parts; stores are opened from the config's paths.
    pub fn new(
        config: Config,
        extractor: FaceExtractor,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let gallery = GalleryStore::open(&config.data_dir)?;
        let ledger = LedgerBook::open(config.attendance_dir())?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            attendance_dir = %config.attendance_dir().display(),
            feature_len = extractor.feature_len(),
            "application context ready"
        );

        Ok(Self {
            config,
            gallery,
            ledger,
            extractor,
            notifier,
            clock,
        })
    }
}
