//! Blocking frame loops that own the capture device for one run.
//!
//! The device is opened only after the controller has entered its active
//! state and is dropped before the controller leaves it, on every path.
//! These loops block the calling thread; async callers run them under
//! `tokio::task::block_in_place`.

use rollcall_hw::{CameraError, FrameSource};

use crate::context::AppContext;
use crate::enrollment::{EnrollStep, EnrollmentController, EnrollmentOutcome, EnrollmentState};
use crate::error::EngineError;
use crate::session::{AutoStop, SessionController, SessionSummary, StepReport};

/// Run one attendance session from `start` to `finish`.
///
/// A capture failure mid-run ends the session as Stopped with the failure
/// recorded in [`SessionSummary::warning`].
pub fn run_attendance<S, O, F>(
    ctx: &mut AppContext,
    session: &mut SessionController,
    policy: AutoStop,
    open: O,
    mut on_step: F,
) -> Result<SessionSummary, EngineError>
where
    S: FrameSource,
    O: FnOnce() -> Result<S, CameraError>,
    F: FnMut(&StepReport),
{
    session.start(ctx, policy)?;

    let mut source = match open() {
        Ok(source) => source,
        Err(err) => {
            session.abort();
            return Err(EngineError::DeviceUnavailable(err));
        }
    };

    let interval = ctx.config.attend_interval();
    loop {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                session.device_lost(err.to_string());
                break;
            }
        };

        let report = match session.step(ctx, &frame) {
            Ok(report) => report,
            Err(err) => {
                drop(source);
                return Err(err);
            }
        };
        on_step(&report);
        if report.state.is_terminal() {
            break;
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    drop(source);
    session.finish(ctx)
}

/// Run one enrollment for `name` from `begin` to `finish`.
///
/// A capture failure commits whatever was gathered so far.
pub fn run_enrollment<S, O, F>(
    ctx: &mut AppContext,
    enrollment: &mut EnrollmentController,
    name: &str,
    open: O,
    mut on_step: F,
) -> Result<EnrollmentOutcome, EngineError>
where
    S: FrameSource,
    O: FnOnce() -> Result<S, CameraError>,
    F: FnMut(&EnrollStep),
{
    enrollment.begin(name)?;

    let mut source = match open() {
        Ok(source) => source,
        Err(err) => {
            enrollment.abort();
            return Err(EngineError::DeviceUnavailable(err));
        }
    };

    let interval = ctx.config.enroll_interval();
    loop {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "capture device lost during enrollment");
                drop(source);
                enrollment.stop_now(ctx)?;
                return enrollment.finish();
            }
        };

        let step = enrollment.step(ctx, &frame)?;
        on_step(&step);
        if step.state == EnrollmentState::Committed {
            break;
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    drop(source);
    enrollment.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::session::SessionState;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn test_attendance_releases_device_after_auto_stop() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[("alice", ALICE), ("bob", BOB)], 5);
        let source = ScriptedSource::new([
            band_frame(&[ALICE]),
            band_frame(&[BOB]),
            band_frame(&[ALICE]),
        ]);
        let released = Arc::clone(&source.released);

        let mut session = SessionController::new();
        let mut steps = 0;
        let summary = run_attendance(
            &mut h.ctx,
            &mut session,
            AutoStop::AllRegisteredUsers,
            || Ok(source),
            |_| steps += 1,
        )
        .unwrap();

        assert_eq!(steps, 2);
        assert_eq!(summary.outcome, SessionState::AutoStoppedAllUsers);
        assert!(summary.warning.is_none());
        assert!(*released.lock().unwrap());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_attendance_device_loss_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[("alice", ALICE), ("bob", BOB)], 5);
        let source = ScriptedSource::new([band_frame(&[ALICE])]);
        let released = Arc::clone(&source.released);

        let mut session = SessionController::new();
        let summary = run_attendance(
            &mut h.ctx,
            &mut session,
            AutoStop::AllRegisteredUsers,
            || Ok(source),
            |_| {},
        )
        .unwrap();

        assert_eq!(summary.outcome, SessionState::Stopped);
        assert!(summary.warning.unwrap().contains("end of script"));
        assert_eq!(summary.recorded.len(), 1);
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_attendance_open_failure_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[("alice", ALICE)], 5);
        let mut session = SessionController::new();

        let err = run_attendance(
            &mut h.ctx,
            &mut session,
            AutoStop::AllRegisteredUsers,
            || -> Result<ScriptedSource, CameraError> {
                Err(CameraError::DeviceNotFound("/dev/video9".into()))
            },
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::DeviceUnavailable(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_empty_gallery_never_opens_device() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[], 0);
        let opened = Mutex::new(false);
        let mut session = SessionController::new();

        let err = run_attendance(
            &mut h.ctx,
            &mut session,
            AutoStop::AllRegisteredUsers,
            || {
                *opened.lock().unwrap() = true;
                Ok(ScriptedSource::new([]))
            },
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::EmptyGallery));
        assert!(!*opened.lock().unwrap());
    }

    #[test]
    fn test_enrollment_commits_partial_batch_on_device_loss() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[], 0);
        let frames: Vec<_> = (0..7).map(|_| band_frame(&[ERIN])).collect();
        let source = ScriptedSource::new(frames);
        let released = Arc::clone(&source.released);

        let mut enrollment = EnrollmentController::new(5, 5);
        let outcome = run_enrollment(&mut h.ctx, &mut enrollment, "erin", || Ok(source), |_| {}).unwrap();

        assert_eq!(
            outcome,
            EnrollmentOutcome::Enrolled {
                name: "erin".into(),
                samples: 2
            }
        );
        assert!(*released.lock().unwrap());
        assert_eq!(enrollment.state(), EnrollmentState::Idle);
    }

    #[test]
    fn test_enrollment_then_attendance() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(dir.path(), &[("alice", ALICE)], 5);

        let frames: Vec<_> = (0..25).map(|_| band_frame(&[BOB])).collect();
        let mut enrollment = EnrollmentController::new(5, 5);
        run_enrollment(&mut h.ctx, &mut enrollment, "bob", || Ok(ScriptedSource::new(frames)), |_| {}).unwrap();

        let mut session = SessionController::new();
        let summary = run_attendance(
            &mut h.ctx,
            &mut session,
            AutoStop::AllRegisteredUsers,
            || Ok(ScriptedSource::new([band_frame(&[ALICE, BOB])])),
            |_| {},
        )
        .unwrap();

        assert_eq!(summary.outcome, SessionState::AutoStoppedAllUsers);
        assert_eq!(summary.seen, vec!["alice", "bob"]);
    }
}
