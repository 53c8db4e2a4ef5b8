//! Retry with exponential backoff.
//!
//! The routine takes the sleep primitive as a parameter so tests can drive it
//! without real timers, and reports a typed outcome instead of raising.

use crate::config::RateLimitConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt budget and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Result of a single attempt, as judged by the caller.
#[derive(Debug)]
pub enum Step<T, E> {
    Done(T),
    /// Worth another attempt (timeouts, 5xx, throttling)
    Transient(E),
    /// Retrying cannot help (4xx, malformed input)
    Fatal(E),
}

/// Final outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: E },
    Fatal { attempts: u32, error: E },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Fatal { attempts, .. } => *attempts,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the attempt budget runs out.
///
/// `op` receives the 1-based attempt number. `sleep` is awaited between
/// transient failures with the policy's backoff delay.
pub async fn retry_with_backoff<T, E, Op, OpFut, Sleep, SleepFut>(
    policy: &BackoffPolicy,
    mut sleep: Sleep,
    mut op: Op,
) -> RetryOutcome<T, E>
where
    E: Display,
    Op: FnMut(u32) -> OpFut,
    OpFut: Future<Output = Step<T, E>>,
    Sleep: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match op(attempt).await {
            Step::Done(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                }
            }
            Step::Fatal(error) => {
                return RetryOutcome::Fatal {
                    attempts: attempt,
                    error,
                }
            }
            Step::Transient(error) => {
                if attempt >= max_attempts {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    };
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    "[attempt {}/{}] transient failure: {} - retrying in {:?}",
                    attempt, max_attempts, error, delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    #[test]
    fn test_delay_curve_is_capped() {
        let p = policy(10);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(350));
        assert_eq!(p.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let delays = RefCell::new(Vec::new());
        let outcome = retry_with_backoff(
            &policy(5),
            |d| {
                delays.borrow_mut().push(d);
                std::future::ready(())
            },
            |attempt| async move {
                if attempt < 3 {
                    Step::Transient("HTTP 503")
                } else {
                    Step::Done(attempt)
                }
            },
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::Success { value: 3, attempts: 3 }));
        assert_eq!(
            *delays.borrow(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_cause() {
        let sleeps = RefCell::new(0);
        let outcome: RetryOutcome<(), &str> = retry_with_backoff(
            &policy(3),
            |_| {
                *sleeps.borrow_mut() += 1;
                std::future::ready(())
            },
            |_| async { Step::Transient("timeout") },
        )
        .await;

        match outcome {
            RetryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "timeout");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // No sleep after the final attempt
        assert_eq!(*sleeps.borrow(), 2);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = RefCell::new(0);
        let outcome: RetryOutcome<(), &str> = retry_with_backoff(
            &policy(5),
            |_| std::future::ready(()),
            |_| {
                *calls.borrow_mut() += 1;
                async { Step::Fatal("HTTP 404") }
            },
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::Fatal { attempts: 1, .. }));
        assert_eq!(*calls.borrow(), 1);
    }
}
