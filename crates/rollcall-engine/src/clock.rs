//! Time source for session timing and ledger timestamps.

use chrono::NaiveDateTime;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic instant for elapsed-time checks.
    fn now(&self) -> Instant;
    /// Local wall-clock date and time for ledger rows.
    fn local_now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}
