use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetrySection;
use crate::control::{Cancelled, ControlSignal};

/// How a failed attempt should be treated, decided once per failure by the
/// caller-supplied predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable { retry_after: Option<Duration> },
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub number: u32,
    /// Time slept before this attempt started.
    pub waited_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: Vec<ExecutionAttempt>,
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: Vec<ExecutionAttempt>,
    /// True when every allowed attempt failed with a retryable error.
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetrySection) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(Duration::from_millis(config.jitter_ms))
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the attempt following failed attempt number `attempt`
    /// (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.delay_for_attempt(attempt);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        if !self.jitter.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }

    /// Runs `operation` until it succeeds, fails fatally, or `max_attempts`
    /// attempts have been made. Backoff sleeps are interrupted by a stop
    /// request, which surfaces as `E::from(Cancelled)`.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        signal: &ControlSignal,
        classify: C,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
        E: From<Cancelled> + std::fmt::Display,
    {
        let mut attempts = Vec::new();
        let mut waited = Duration::ZERO;
        let mut number = 1u32;
        loop {
            if let Err(cancelled) = signal.checkpoint() {
                return Err(RetryFailure {
                    error: E::from(cancelled),
                    attempts,
                    exhausted: false,
                });
            }
            match operation(number).await {
                Ok(result) => {
                    attempts.push(ExecutionAttempt {
                        number,
                        waited_ms: waited.as_millis() as u64,
                        outcome: AttemptOutcome::Success,
                    });
                    return Ok(RetryOutcome { result, attempts });
                }
                Err(error) => match classify(&error) {
                    FailureClass::Fatal => {
                        attempts.push(ExecutionAttempt {
                            number,
                            waited_ms: waited.as_millis() as u64,
                            outcome: AttemptOutcome::FatalFailure,
                        });
                        warn!(attempt = number, error = %error, "fatal failure, not retrying");
                        return Err(RetryFailure {
                            error,
                            attempts,
                            exhausted: false,
                        });
                    }
                    FailureClass::Retryable { retry_after } => {
                        attempts.push(ExecutionAttempt {
                            number,
                            waited_ms: waited.as_millis() as u64,
                            outcome: AttemptOutcome::RetryableFailure,
                        });
                        if number >= self.max_attempts {
                            warn!(
                                attempts = number,
                                error = %error,
                                "retry attempts exhausted"
                            );
                            return Err(RetryFailure {
                                error,
                                attempts,
                                exhausted: true,
                            });
                        }
                        let delay = self.next_delay(number, retry_after);
                        debug!(
                            attempt = number,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retryable failure, backing off"
                        );
                        if let Err(cancelled) = signal.sleep(delay).await {
                            return Err(RetryFailure {
                                error: E::from(cancelled),
                                attempts,
                                exhausted: false,
                            });
                        }
                        waited = delay;
                        number += 1;
                    }
                },
            }
        }
    }
}
