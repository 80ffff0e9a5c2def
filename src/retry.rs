//! Retry timing shared by the mailbox and OAuth clients.
//!
//! Attempt `n` (1-based) waits `base_delay * 2^(n-1)`, capped at 32s. A
//! server `Retry-After` replaces the computed step for that attempt.

use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(32);

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(d) => d.min(MAX_BACKOFF),
            None => {
                let step = self.base_delay * (1u32 << attempt.saturating_sub(1).min(5));
                step.min(MAX_BACKOFF)
            }
        }
    }
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
