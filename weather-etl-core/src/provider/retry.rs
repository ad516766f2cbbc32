//! Per-attempt retry decisions for forecast requests.
//!
//! Kept free of I/O so the whole state machine can be exercised with plain values.

use std::time::Duration;

/// Delay before retrying after a network or timeout error.
pub const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

const TRANSIENT_STATUSES: [u16; 4] = [500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds.
    pub backoff_base: f64,
}

/// What a single attempt ended with, when it did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Status(u16),
    Transport,
    /// The request could not be built or followed; repeating it cannot help.
    InvalidRequest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    RetryAfter(Duration),
    Fail,
    Exhausted,
}

impl RetryPolicy {
    /// Decide what to do after `attempt` (0-indexed) ended with `failure`.
    pub fn decide(&self, attempt: u32, failure: Failure) -> Decision {
        let last_attempt = attempt + 1 >= self.max_attempts;

        match failure {
            // Hard quota ceiling: never hammer it.
            Failure::Status(429) => Decision::Fail,
            Failure::Status(status) if TRANSIENT_STATUSES.contains(&status) => {
                if last_attempt {
                    Decision::Exhausted
                } else {
                    Decision::RetryAfter(self.backoff(attempt))
                }
            }
            Failure::Status(_) | Failure::InvalidRequest => Decision::Fail,
            Failure::Transport => {
                if last_attempt {
                    Decision::Exhausted
                } else {
                    Decision::RetryAfter(TRANSPORT_RETRY_DELAY)
                }
            }
        }
    }

    /// `backoff_base ^ attempt` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_base.max(0.0).powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
