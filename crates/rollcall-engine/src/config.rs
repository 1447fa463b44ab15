use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use rollcall_core::DetectorParams;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine configuration: optional TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution; the driver may negotiate another.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory holding the gallery files and, by default, the detector model.
    pub data_dir: PathBuf,
    /// Directory for daily ledgers (default: `<data_dir>/attendance`).
    pub attendance_dir: Option<PathBuf>,
    /// Cascade model file (default: `<data_dir>/seeta_fd_frontal_v1.0.bin`).
    pub detector_model: Option<PathBuf>,
    /// Edge length of the square face crop; feature length is `face_size² · 3`.
    pub face_size: u32,
    /// Neighbour count for kNN voting.
    pub knn_k: usize,
    /// Samples gathered per enrollment run.
    pub enroll_samples: usize,
    /// Keep every Nth detected face while enrolling.
    pub enroll_stride: usize,
    /// Pause between frames while taking attendance.
    pub attend_interval_ms: u64,
    /// Pause between frames while enrolling.
    pub enroll_interval_ms: u64,
    pub detector: DetectorConfig,
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub min_face_size: u32,
    pub scale_step: f32,
    pub score_threshold: f64,
    pub window_step: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Command that speaks its final argument, e.g. `espeak` or `spd-say -w`.
    /// Empty disables speech; messages are then only logged.
    pub speech_command: String,
    /// Pending messages beyond this are dropped with a warning.
    pub queue_depth: usize,
}

/// Download location of the default detector model.
pub const DETECTOR_MODEL_URL: &str =
    "https://github.com/atomashpolskiy/rustface/raw/master/model/seeta_fd_frontal_v1.0.bin";
const DETECTOR_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            data_dir,
            attendance_dir: None,
            detector_model: None,
            face_size: 50,
            knn_k: rollcall_core::classifier::DEFAULT_K,
            enroll_samples: 5,
            enroll_stride: 5,
            attend_interval_ms: 50,
            enroll_interval_ms: 200,
            detector: DetectorConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let params = DetectorParams::default();
        Self {
            min_face_size: params.min_face_size,
            scale_step: params.scale_step,
            score_threshold: params.score_threshold,
            window_step: params.window_step,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            speech_command: "espeak".to_string(),
            queue_depth: 16,
        }
    }
}

impl Config {
    /// Load from `path` (or `$ROLLCALL_CONFIG`) if given, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        tracing::debug!(path = %shown, "loaded config file");
        Ok(config)
    }

    /// Override fields from `ROLLCALL_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_ATTENDANCE_DIR") {
            self.attendance_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ROLLCALL_SPEECH_COMMAND") {
            self.feedback.speech_command = v;
        }
        self.attend_interval_ms = env_parse("ROLLCALL_FRAME_INTERVAL_MS", self.attend_interval_ms);
        self.knn_k = env_parse("ROLLCALL_KNN_K", self.knn_k);
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.attendance_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attendance"))
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.detector_model
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DETECTOR_MODEL_FILE))
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            min_face_size: self.detector.min_face_size,
            scale_step: self.detector.scale_step,
            score_threshold: self.detector.score_threshold,
            window_step: self.detector.window_step,
        }
    }

    pub fn attend_interval(&self) -> Duration {
        Duration::from_millis(self.attend_interval_ms)
    }

    pub fn enroll_interval(&self) -> Duration {
        Duration::from_millis(self.enroll_interval_ms)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
