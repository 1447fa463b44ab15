//! Operator feedback: a bounded message queue drained by a dedicated thread.
//!
//! Controllers push plain strings with [`Notifier::notify`], which never
//! blocks. The feedback thread hands each message to a [`FeedbackSink`]
//! (speech synthesis, or the log). Sink failures are logged and dropped;
//! they never reach the controller. Nothing waits on the thread during a
//! session; a process about to exit calls [`Notifier::shutdown`] so queued
//! messages are still spoken.

use std::process::Command;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("failed to start feedback thread: {0}")]
    Spawn(std::io::Error),
    #[error("feedback command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },
    #[error("feedback queue full; message dropped")]
    QueueFull,
    #[error("feedback thread exited")]
    ChannelClosed,
}

/// Destination for feedback messages.
pub trait FeedbackSink: Send {
    fn deliver(&mut self, message: &str) -> Result<(), FeedbackError>;
}

/// Speaks messages by running an external text-to-speech command.
pub struct SpeechSink {
    program: String,
    args: Vec<String>,
}

impl SpeechSink {
    /// Parse a command line such as `espeak` or `spd-say -w`; the message is
    /// appended as the final argument. `None` for a blank command.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl FeedbackSink for SpeechSink {
    fn deliver(&mut self, message: &str) -> Result<(), FeedbackError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(message)
            .status()
            .map_err(|e| FeedbackError::CommandFailed {
                command: self.program.clone(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(FeedbackError::CommandFailed {
                command: self.program.clone(),
                reason: status.to_string(),
            })
        }
    }
}

/// Writes messages to the log only.
pub struct LogSink;

impl FeedbackSink for LogSink {
    fn deliver(&mut self, message: &str) -> Result<(), FeedbackError> {
        tracing::info!(msg = message, "feedback");
        Ok(())
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done: std_mpsc::Receiver<()>,
}

/// Clone-safe, non-blocking handle to the feedback thread.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<String>>,
    worker: Option<Arc<Mutex<Option<Worker>>>>,
}

impl Notifier {
    /// Spawn the feedback thread with a queue of `depth` pending messages.
    pub fn spawn(mut sink: Box<dyn FeedbackSink>, depth: usize) -> Result<Self, FeedbackError> {
        let (tx, mut rx) = mpsc::channel::<String>(depth.max(1));
        let (done_tx, done) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("rollcall-feedback".into())
            .spawn(move || {
                tracing::debug!("feedback thread started");
                while let Some(message) = rx.blocking_recv() {
                    if let Err(err) = sink.deliver(&message) {
                        tracing::warn!(error = %err, msg = %message, "feedback delivery failed");
                    }
                }
                tracing::debug!("feedback thread exiting");
                let _ = done_tx.send(());
            })
            .map_err(FeedbackError::Spawn)?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(Arc::new(Mutex::new(Some(Worker { handle, done })))),
        })
    }

    /// A notifier that discards every message.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            worker: None,
        }
    }

    /// Close this handle's queue and wait up to `timeout` for the feedback
    /// thread to deliver what is already queued.
    ///
    /// Returns `false` if the thread was still busy when the timeout ran out
    /// (including when another clone still holds the queue open). Later
    /// `notify` calls on this handle are dropped silently.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.tx = None;
        let worker = match self.worker.take() {
            Some(shared) => {
                let mut slot = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let worker = slot.take();
                worker
            }
            None => None,
        };
        let Some(worker) = worker else {
            return true;
        };

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::warn!("feedback thread panicked");
                }
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "feedback still pending at shutdown"
                );
                false
            }
        }
    }

    /// Queue a message without waiting. Failures are logged, never returned.
    pub fn notify(&self, message: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let err = match tx.try_send(message.into()) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => FeedbackError::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => FeedbackError::ChannelClosed,
        };
        tracing::warn!(error = %err, "feedback not delivered");
    }
}
