//! `UpdateReady` retry bookkeeping, pulled out of the send loop so the
//! timeout policy is unit-testable without a real clock: tests inject a
//! schedule of zero-length waits instead of waiting on `tokio::time::sleep`
//! for real.

use std::time::Duration;

/// An ordered sequence of waits, one per `UpdateBegin` attempt. The default
/// schedule matches spec.md §4.3: three 6s waits, then one final 90s wait.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    waits: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(waits: Vec<Duration>) -> Self {
        Self { waits }
    }

    /// Three `retry_wait` waits, then one `final_wait`.
    pub fn particle_default(retry_wait: Duration, retries: u32, final_wait: Duration) -> Self {
        let mut waits: Vec<Duration> = std::iter::repeat(retry_wait).take(retries as usize).collect();
        waits.push(final_wait);
        Self { waits }
    }

    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }
}
