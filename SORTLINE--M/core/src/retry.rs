use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Bounded retry with an exponential pause before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts made before giving up (at least one).
    pub max_attempts: u32,
    /// Pause before the first attempt.
    pub base_delay: Duration,
    /// Growth factor between consecutive pauses.
    pub factor: f64,
    /// Upper bound for a single pause.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The operation eventually succeeded.
    Recovered {
        /// Value returned by the successful attempt.
        value: T,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: E,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the operation succeeded.
    #[must_use]
    pub const fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }

    /// Number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Recovered { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Overrides the cap on a single pause.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Pause preceding the attempt with zero-based index `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds or the attempts are exhausted,
    /// pausing on `clock` before each attempt.
    pub async fn run<C, F, Fut, T, E>(&self, clock: &C, mut operation: F) -> RetryOutcome<T, E>
    where
        C: Clock + ?Sized,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            clock.sleep(self.delay_for(attempt)).await;
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Recovered {
                        value,
                        attempts: attempt,
                    }
                }
                Err(err) if attempt >= max_attempts => {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    }
                }
                Err(_) => {
                    tracing::debug!(attempt, max_attempts, "retry attempt failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::clock::TokioClock;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let clock = TokioClock::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let outcome: RetryOutcome<&str, &str> = policy
            .run(&clock, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("relay stuck")
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(
            outcome,
            RetryOutcome::Recovered {
                value: "ok",
                attempts: 3
            }
        );
        // 100 + 200 + 400 ms of pauses.
        assert!(clock.now().as_secs() >= 0.7 - 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let clock = TokioClock::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let outcome: RetryOutcome<(), u32> = policy.run(&clock, |attempt| async move { Err(attempt) }).await;
        assert!(!outcome.is_recovered());
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 2,
                last_error: 2
            }
        );
    }
}
