//! Attempt budget and randomised backoff for pool mutations.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(800);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
const MAX_DOUBLINGS: u32 = 16;

/// Bounds how long a pool operation keeps retrying.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up; values below one are treated as one.
    pub max_attempts: u32,
    /// Smallest pause between attempts.
    pub base_backoff: Duration,
    /// Largest pause between attempts.
    pub max_backoff: Duration,
    /// Overall wall-clock limit for one operation.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            deadline: Some(DEFAULT_DEADLINE),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and no pauses, for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            deadline: None,
        }
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the overall deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) const fn attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }

    /// Random pause before attempt `attempt + 1`, drawn from
    /// `[base, min(max, base * 2^attempt)]`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = millis(self.base_backoff);
        let cap = millis(self.max_backoff).max(base);
        let ceiling = base
            .saturating_mul(1_u64 << attempt.min(MAX_DOUBLINGS))
            .clamp(base, cap);
        Duration::from_millis(rand::thread_rng().gen_range(base..=ceiling))
    }

    /// Short random pause used to widen the gap between a read and the
    /// verifying read on backends without conditional writes.
    pub(crate) fn settle_pause(&self) -> Duration {
        let base = millis(self.base_backoff);
        Duration::from_millis(rand::thread_rng().gen_range(0..=base))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..20 {
            let pause = policy.backoff(attempt);
            assert!(pause >= policy.base_backoff, "attempt {attempt}: {pause:?}");
            assert!(pause <= policy.max_backoff, "attempt {attempt}: {pause:?}");
        }
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff(4), Duration::ZERO);
        assert_eq!(policy.settle_pause(), Duration::ZERO);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::immediate(0).attempts(), 1);
    }
}
