//! Enrollment state machine: `Idle → Collecting → Committed → Idle`.
//!
//! Every `stride`-th detected face is kept, starting with the first, until
//! `target` samples are held or a stop is requested. The batch is appended
//! to the gallery in one call; nothing is written while collecting.

use rollcall_core::FaceSample;
use rollcall_hw::Frame;

use crate::context::AppContext;
use crate::error::EngineError;
use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Idle,
    Collecting,
    Committed,
}

impl EnrollmentState {
    pub fn name(self) -> &'static str {
        match self {
            EnrollmentState::Idle => "idle",
            EnrollmentState::Collecting => "collecting",
            EnrollmentState::Committed => "committed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Enrolled { name: String, samples: usize },
    /// Stopped before any face was sampled; the gallery is untouched.
    NoSamples { name: String },
}

#[derive(Debug, Clone)]
pub struct EnrollStep {
    pub state: EnrollmentState,
    pub captured: usize,
    pub target: usize,
    /// Faces found in this frame.
    pub faces: usize,
}

struct Batch {
    name: String,
    samples: Vec<FaceSample>,
    faces_seen: usize,
}

pub struct EnrollmentController {
    state: EnrollmentState,
    stop: StopSignal,
    target: usize,
    stride: usize,
    batch: Option<Batch>,
    outcome: Option<EnrollmentOutcome>,
}

impl EnrollmentController {
    pub fn new(target: usize, stride: usize) -> Self {
        Self {
            state: EnrollmentState::Idle,
            stop: StopSignal::new(),
            target: target.max(1),
            stride: stride.max(1),
            batch: None,
            outcome: None,
        }
    }

    /// Controller using the configured sample count and stride.
    pub fn from_config(ctx: &AppContext) -> Self {
        Self::new(ctx.config.enroll_samples, ctx.config.enroll_stride)
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    /// A request made before `begin` commits at the first step.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn captured(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.samples.len())
    }

    /// Idle → Collecting for `name`. A blank name leaves the controller Idle.
    pub fn begin(&mut self, name: &str) -> Result<(), EngineError> {
        if self.state != EnrollmentState::Idle {
            return Err(EngineError::InvalidState {
                operation: "begin",
                state: self.state.name(),
            });
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        tracing::info!(name, target = self.target, stride = self.stride, "enrollment started");
        self.outcome = None;
        self.batch = Some(Batch {
            name: name.to_string(),
            samples: Vec::with_capacity(self.target),
            faces_seen: 0,
        });
        self.state = EnrollmentState::Collecting;
        Ok(())
    }

    /// Sample faces from one frame; commits once the target is reached or a
    /// stop has been requested. A failed commit returns to Idle.
    pub fn step(&mut self, ctx: &mut AppContext, frame: &Frame) -> Result<EnrollStep, EngineError> {
        if self.state != EnrollmentState::Collecting {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: self.state.name(),
            });
        }

        let mut faces = 0;
        if !self.stop.is_requested() {
            let crops = ctx
                .extractor
                .extract(&frame.data, frame.width, frame.height)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, seq = frame.sequence, "face extraction failed; skipping frame");
                    Vec::new()
                });
            faces = crops.len();

            if let Some(batch) = self.batch.as_mut() {
                for crop in crops {
                    if batch.samples.len() >= self.target {
                        break;
                    }
                    if batch.faces_seen % self.stride == 0 {
                        batch.samples.push(FaceSample::new(batch.name.clone(), crop.features));
                        tracing::debug!(captured = batch.samples.len(), target = self.target, "face sampled");
                    }
                    batch.faces_seen += 1;
                }
            }
        }

        if self.stop.is_requested() || self.captured() >= self.target {
            self.commit(ctx)?;
        }

        Ok(EnrollStep {
            state: self.state,
            captured: self.captured(),
            target: self.target,
            faces,
        })
    }

    fn commit(&mut self, ctx: &AppContext) -> Result<(), EngineError> {
        let Some(batch) = self.batch.as_ref() else {
            self.state = EnrollmentState::Idle;
            return Ok(());
        };

        if batch.samples.is_empty() {
            tracing::info!(name = %batch.name, "enrollment stopped with no samples");
            self.outcome = Some(EnrollmentOutcome::NoSamples {
                name: batch.name.clone(),
            });
            self.state = EnrollmentState::Committed;
            return Ok(());
        }

        if let Err(err) = ctx.gallery.append(&batch.samples) {
            tracing::error!(error = %err, name = %batch.name, "gallery append failed");
            self.batch = None;
            self.stop.reset();
            self.state = EnrollmentState::Idle;
            return Err(err.into());
        }

        let samples = batch.samples.len();
        tracing::info!(name = %batch.name, samples, "enrollment committed");
        ctx.notifier.notify(format!(
            "Registered {} with {} face captures",
            batch.name, samples
        ));
        self.outcome = Some(EnrollmentOutcome::Enrolled {
            name: batch.name.clone(),
            samples,
        });
        self.state = EnrollmentState::Committed;
        Ok(())
    }

    /// Force a commit of whatever has been gathered, for callers that stop
    /// without another frame to step (e.g. the device failed).
    pub fn stop_now(&mut self, ctx: &AppContext) -> Result<(), EngineError> {
        if self.state != EnrollmentState::Collecting {
            return Ok(());
        }
        self.stop.request();
        self.commit(ctx)
    }

    /// Discard the batch without writing anything.
    pub(crate) fn abort(&mut self) {
        if let Some(batch) = self.batch.take() {
            tracing::warn!(name = %batch.name, "enrollment aborted");
        }
        self.stop.reset();
        self.state = EnrollmentState::Idle;
    }

    /// Committed → Idle, returning what was committed.
    pub fn finish(&mut self) -> Result<EnrollmentOutcome, EngineError> {
        if self.state != EnrollmentState::Committed {
            return Err(EngineError::InvalidState {
                operation: "finish",
                state: self.state.name(),
            });
        }
        self.stop.reset();
        self.state = EnrollmentState::Idle;
        self.batch = None;
        self.outcome.take().ok_or(EngineError::InvalidState {
            operation: "finish",
            state: "committed without an outcome",
        })
    }
}
