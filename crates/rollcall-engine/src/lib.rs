//! rollcall-engine — Attendance and enrollment state machines.
//!
//! [`SessionController`] and [`EnrollmentController`] are driven one frame
//! at a time; [`driver`] wraps them in blocking capture loops that own the
//! camera for exactly one run. Everything they touch lives in an
//! [`AppContext`] built from [`Config`].

pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod enrollment;
pub mod error;
pub mod feedback;
pub mod session;
pub mod stop;

#[cfg(test)]
pub(crate) mod testutil;

pub use clock::{Clock, SystemClock};
pub use config::{Config, ConfigError, DETECTOR_MODEL_URL};
pub use context::AppContext;
pub use enrollment::{EnrollStep, EnrollmentController, EnrollmentOutcome, EnrollmentState};
pub use error::EngineError;
pub use feedback::{FeedbackError, FeedbackSink, LogSink, Notifier, SpeechSink};
pub use session::{AutoStop, SessionController, SessionState, SessionSummary, StepReport};
pub use stop::StopSignal;
