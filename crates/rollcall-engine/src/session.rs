//! Attendance session state machine.
//!
//! ```text
//! Idle ──start──▶ Running ──step…──▶ Stopped | AutoStoppedAllUsers
//!                                    | AutoStoppedMinUsers | AutoStoppedTimeLimit
//!   ▲                                            │
//!   └──────────────────finish────────────────────┘
//! ```
//!
//! `start` retrains the classifier from the current gallery, so faces
//! enrolled between sessions are recognised. A driver calls `step` once per
//! captured frame. Each step records first sightings on today's ledger,
//! then checks stop conditions: an explicit stop request always wins,
//! otherwise the auto-stop policy chosen at start decides.
//!
//! Duplicate suppression is keyed on the predicted label alone. A frame
//! misclassified as someone else marks that person present and the real
//! person may never be recorded for the day.

use chrono::{NaiveDate, Timelike};
use rollcall_core::{AttendanceRecord, KnnClassifier, RecordOutcome};
use rollcall_hw::Frame;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::EngineError;
use crate::stop::StopSignal;

/// Shortest accepted time limit.
pub const MIN_TIME_LIMIT: Duration = Duration::from_secs(10);
/// Longest accepted time limit.
pub const MAX_TIME_LIMIT: Duration = Duration::from_secs(300);
/// Time limit offered when the operator does not pick one.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    AutoStoppedAllUsers,
    AutoStoppedMinUsers,
    AutoStoppedTimeLimit,
}

impl SessionState {
    /// True for the four end states a session can reach from `Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Running)
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::AutoStoppedAllUsers => "auto-stopped (all users)",
            SessionState::AutoStoppedMinUsers => "auto-stopped (minimum users)",
            SessionState::AutoStoppedTimeLimit => "auto-stopped (time limit)",
        }
    }
}

/// When a running session ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStop {
    /// Every distinct label in the gallery has been seen.
    AllRegisteredUsers,
    /// At least this many distinct names have been seen.
    MinimumUsers(usize),
    /// This much wall-clock time has passed since `start`.
    TimeLimit(Duration),
}

impl AutoStop {
    /// Default minimum-users target for a gallery with `registered` labels.
    pub fn default_minimum(registered: usize) -> usize {
        registered.clamp(1, 3)
    }

    fn validate(self, registered: usize) -> Result<(), EngineError> {
        match self {
            AutoStop::AllRegisteredUsers => Ok(()),
            AutoStop::MinimumUsers(n) if (1..=registered).contains(&n) => Ok(()),
            AutoStop::MinimumUsers(n) => Err(EngineError::InvalidPolicy(format!(
                "minimum users must be between 1 and {registered}, got {n}"
            ))),
            AutoStop::TimeLimit(d) if (MIN_TIME_LIMIT..=MAX_TIME_LIMIT).contains(&d) => Ok(()),
            AutoStop::TimeLimit(d) => Err(EngineError::InvalidPolicy(format!(
                "time limit must be between {}s and {}s, got {}s",
                MIN_TIME_LIMIT.as_secs(),
                MAX_TIME_LIMIT.as_secs(),
                d.as_secs()
            ))),
        }
    }
}

/// What one `step` did.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub state: SessionState,
    /// Faces found in this frame.
    pub faces: usize,
    /// Predicted label for each face, in detection order.
    pub labels: Vec<String>,
    /// Rows written to today's ledger during this step.
    pub newly_recorded: Vec<AttendanceRecord>,
    /// Non-decreasing progress towards the auto-stop condition, in [0, 1].
    pub progress: f32,
    pub progress_text: String,
}

/// Final account of a session, returned by `finish`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub outcome: SessionState,
    pub date: NaiveDate,
    /// Rows this session wrote, in detection order.
    pub recorded: Vec<AttendanceRecord>,
    /// Every distinct name seen, including ones already on today's ledger.
    pub seen: Vec<String>,
    pub elapsed: Duration,
    /// Set when the session ended because the capture device failed.
    pub warning: Option<String>,
}

struct ActiveSession {
    id: Uuid,
    classifier: KnnClassifier,
    policy: AutoStop,
    registered: usize,
    seen: BTreeSet<String>,
    recorded: Vec<AttendanceRecord>,
    started: Instant,
    date: NaiveDate,
    progress: f32,
    warning: Option<String>,
    span: tracing::Span,
}

impl ActiveSession {
    fn target_users(&self) -> usize {
        match self.policy {
            AutoStop::AllRegisteredUsers => self.registered,
            AutoStop::MinimumUsers(n) => n,
            AutoStop::TimeLimit(_) => 0,
        }
    }

    /// Advance progress for the current policy; never moves backwards.
    fn update_progress(&mut self, elapsed: Duration) -> String {
        let (fraction, text) = match self.policy {
            AutoStop::AllRegisteredUsers => (
                ratio(self.seen.len() as f32, self.registered as f32),
                format!("Detected {}/{} registered users", self.seen.len(), self.registered),
            ),
            AutoStop::MinimumUsers(n) => (
                ratio(self.seen.len() as f32, n as f32),
                format!("Detected {}/{} users", self.seen.len(), n),
            ),
            AutoStop::TimeLimit(limit) => (
                ratio(elapsed.as_secs_f32(), limit.as_secs_f32()),
                format!("Time: {}/{} seconds", elapsed.as_secs(), limit.as_secs()),
            ),
        };
        self.progress = self.progress.max(fraction);
        text
    }

    fn auto_stop(&self, elapsed: Duration) -> Option<SessionState> {
        match self.policy {
            AutoStop::AllRegisteredUsers if self.seen.len() >= self.registered => {
                Some(SessionState::AutoStoppedAllUsers)
            }
            AutoStop::MinimumUsers(n) if self.seen.len() >= n => {
                Some(SessionState::AutoStoppedMinUsers)
            }
            AutoStop::TimeLimit(limit) if elapsed >= limit => {
                Some(SessionState::AutoStoppedTimeLimit)
            }
            _ => None,
        }
    }
}

fn ratio(num: f32, den: f32) -> f32 {
    if den <= 0.0 {
        1.0
    } else {
        (num / den).clamp(0.0, 1.0)
    }
}

/// Drives one attendance session at a time.
pub struct SessionController {
    state: SessionState,
    stop: StopSignal,
    active: Option<ActiveSession>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            stop: StopSignal::new(),
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle for requesting an explicit stop from another thread.
    ///
    /// A request made before `start` stops the next session at its first
    /// step. The flag clears when the session returns to Idle.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn progress(&self) -> f32 {
        self.active.as_ref().map_or(0.0, |a| a.progress)
    }

    /// Names seen so far in the current session.
    pub fn seen(&self) -> Vec<String> {
        self.active
            .as_ref()
            .map(|a| a.seen.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Idle → Running. Loads and trains on the full gallery.
    ///
    /// Stays Idle and returns `EmptyGallery`, `StoreCorrupt` or
    /// `InvalidPolicy` if the session cannot run.
    pub fn start(&mut self, ctx: &AppContext, policy: AutoStop) -> Result<(), EngineError> {
        if self.state != SessionState::Idle {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: self.state.name(),
            });
        }

        let gallery = ctx.gallery.load()?.ok_or(EngineError::EmptyGallery)?;
        let classifier = KnnClassifier::train(&gallery, ctx.config.knn_k)?;
        if classifier.dim() != ctx.extractor.feature_len() {
            return Err(EngineError::StoreCorrupt(format!(
                "gallery vectors have {} features but the extractor produces {}; re-enroll or restore face_size",
                classifier.dim(),
                ctx.extractor.feature_len()
            )));
        }

        let registered = gallery.distinct_labels().len();
        policy.validate(registered)?;

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", id = %id);
        span.in_scope(|| {
            tracing::info!(
                ?policy,
                registered,
                samples = classifier.len(),
                k = classifier.k(),
                "attendance session started"
            );
        });

        self.active = Some(ActiveSession {
            id,
            classifier,
            policy,
            registered,
            seen: BTreeSet::new(),
            recorded: Vec::new(),
            started: ctx.clock.now(),
            date: ctx.clock.local_now().date(),
            progress: 0.0,
            warning: None,
            span,
        });
        self.state = SessionState::Running;
        Ok(())
    }

    /// Process one frame while Running.
    ///
    /// Detection and classification errors only skip the affected frame or
    /// face. A ledger error aborts the session back to Idle and is returned.
    pub fn step(&mut self, ctx: &mut AppContext, frame: &Frame) -> Result<StepReport, EngineError> {
        if self.state != SessionState::Running {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: self.state.name(),
            });
        }
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: "running without a session",
            });
        };
        let span = active.span.clone();
        let _entered = span.enter();

        if self.stop.is_requested() {
            tracing::info!("stop requested");
            self.state = SessionState::Stopped;
            let elapsed = ctx.clock.now().saturating_duration_since(active.started);
            let progress_text = active.update_progress(elapsed);
            return Ok(StepReport {
                state: self.state,
                faces: 0,
                labels: Vec::new(),
                newly_recorded: Vec::new(),
                progress: active.progress,
                progress_text,
            });
        }

        let crops = match ctx.extractor.extract(&frame.data, frame.width, frame.height) {
            Ok(crops) => crops,
            Err(err) => {
                tracing::warn!(error = %err, seq = frame.sequence, "face extraction failed; skipping frame");
                Vec::new()
            }
        };

        let mut labels = Vec::with_capacity(crops.len());
        let mut newly_recorded = Vec::new();

        for crop in &crops {
            let prediction = match active.classifier.predict(&crop.features) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(error = %err, "classification failed; skipping face");
                    continue;
                }
            };
            let name = prediction.label;
            labels.push(name.clone());

            if active.seen.contains(&name) {
                continue;
            }

            let now = ctx.clock.local_now();
            let time = now.time().with_nanosecond(0).unwrap_or(now.time());
            let outcome = match ctx.ledger.record_if_new(&name, now.date(), time) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, name = %name, "ledger write failed; aborting session");
                    drop(_entered);
                    self.abort();
                    return Err(err.into());
                }
            };

            match outcome {
                RecordOutcome::Recorded(record) => {
                    tracing::info!(
                        name = %record.name,
                        time = %record.time,
                        votes = prediction.votes,
                        k = prediction.k,
                        "attendance marked"
                    );
                    ctx.notifier.notify(format!("Attendance marked for {}", record.name));
                    newly_recorded.push(record.clone());
                    active.recorded.push(record);
                }
                RecordOutcome::AlreadyPresent(record) => {
                    tracing::debug!(name = %record.name, time = %record.time, "already recorded today");
                }
            }
            active.seen.insert(name);
        }

        let elapsed = ctx.clock.now().saturating_duration_since(active.started);
        let progress_text = active.update_progress(elapsed);

        if self.stop.is_requested() {
            self.state = SessionState::Stopped;
        } else if let Some(end) = active.auto_stop(elapsed) {
            tracing::info!(state = end.name(), seen = active.seen.len(), target = active.target_users(), "auto-stop");
            self.state = end;
        }

        Ok(StepReport {
            state: self.state,
            faces: crops.len(),
            labels,
            newly_recorded,
            progress: active.progress,
            progress_text,
        })
    }

    /// The capture device failed: end the session as Stopped with a warning.
    pub fn device_lost(&mut self, reason: impl Into<String>) {
        if self.state != SessionState::Running {
            return;
        }
        let reason = reason.into();
        if let Some(active) = self.active.as_mut() {
            active.span.in_scope(|| {
                tracing::warn!(reason = %reason, "capture device lost; ending session");
            });
            active.warning = Some(reason);
        }
        self.state = SessionState::Stopped;
    }

    /// Drop any in-progress session and return to Idle without a summary.
    pub(crate) fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.span.in_scope(|| tracing::warn!("session aborted"));
        }
        self.stop.reset();
        self.state = SessionState::Idle;
    }

    /// Terminal → Idle. Returns the summary and announces completion.
    pub fn finish(&mut self, ctx: &AppContext) -> Result<SessionSummary, EngineError> {
        if !self.state.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "finish",
                state: self.state.name(),
            });
        }
        self.stop.reset();
        let Some(active) = self.active.take() else {
            self.state = SessionState::Idle;
            return Err(EngineError::InvalidState {
                operation: "finish",
                state: "ended without a session",
            });
        };

        let summary = SessionSummary {
            session_id: active.id,
            outcome: self.state,
            date: active.date,
            recorded: active.recorded,
            seen: active.seen.into_iter().collect(),
            elapsed: ctx.clock.now().saturating_duration_since(active.started),
            warning: active.warning,
        };

        active.span.in_scope(|| {
            tracing::info!(
                outcome = summary.outcome.name(),
                recorded = summary.recorded.len(),
                seen = summary.seen.len(),
                elapsed_secs = summary.elapsed.as_secs(),
                "attendance session finished"
            );
        });

        if !summary.seen.is_empty() {
            ctx.notifier.notify(format!(
                "Attendance completed! Recorded {} students.",
                summary.seen.len()
            ));
        }

        self.state = SessionState::Idle;
        Ok(summary)
    }
}
