//! Retry timing for transient send failures: exponential doubling from an
//! initial delay up to a ceiling, with random jitter so a reconnecting fleet
//! does not thunder in lockstep.

use rand::Rng;

use crate::models::TimestampMs;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_ms: i64,
    pub max_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempts`-th consecutive failure. The first
    /// failure waits `initial_ms`, each further failure doubles, capped at
    /// `max_ms`, plus jitter of up to half the capped delay.
    pub fn delay_ms(&self, attempts: u32) -> i64 {
        let factor = 1i64 << attempts.saturating_sub(1).min(16);
        let capped = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        capped + jitter
    }

    /// Absolute timestamp of the next allowed attempt.
    pub fn next_attempt_at(&self, attempts: u32, now: TimestampMs) -> TimestampMs {
        now.saturating_add(self.delay_ms(attempts))
    }
}
