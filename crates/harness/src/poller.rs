//! Bounded convergence polling.
//!
//! The poller is the only place the harness retries. Callers pass the
//! interval and timeout at every call site.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HarnessError, HarnessResult};

/// Outcome of one observation of the service.
#[derive(Debug)]
pub enum Poll<T> {
    /// The observed state is acceptable; stop polling.
    Converged(T),
    /// Not there yet; the string describes what was observed.
    NotYetConverged(String),
    /// Structurally wrong; stop now without waiting for the timeout.
    Fatal(HarnessError),
}

impl<T> Poll<T> {
    pub fn pending(observed: impl Into<String>) -> Self {
        Poll::NotYetConverged(observed.into())
    }
}

enum Pending {
    Observed(String),
    Unreachable(String),
}

/// Repeatedly evaluates a predicate until it converges, fails fatally, or
/// the timeout elapses.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    label: String,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Poller {
            interval,
            timeout,
            label: "poll".to_string(),
        }
    }

    /// Name used in log lines for this poll.
    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the predicate until it converges.
    ///
    /// An `Err(Unreachable)` from the predicate is retried like
    /// [`Poll::NotYetConverged`]; any other `Err` is fatal. If the budget runs
    /// out while the service is still unreachable the result is
    /// [`HarnessError::Unreachable`], otherwise
    /// [`HarnessError::ConvergenceTimeout`] with the last observation.
    pub fn await_convergence<T, F>(&self, mut predicate: F) -> HarnessResult<T>
    where
        F: FnMut() -> HarnessResult<Poll<T>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let pending = match predicate() {
                Ok(Poll::Converged(value)) => {
                    tracing::info!(
                        label = %self.label,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "converged"
                    );
                    return Ok(value);
                }
                Ok(Poll::Fatal(err)) => {
                    tracing::warn!(label = %self.label, attempts, error = %err, "poll aborted");
                    return Err(err);
                }
                Err(err @ HarnessError::Unreachable { .. }) => Pending::Unreachable(err.to_string()),
                Err(err) => {
                    tracing::warn!(label = %self.label, attempts, error = %err, "poll aborted");
                    return Err(err);
                }
                Ok(Poll::NotYetConverged(observed)) => Pending::Observed(observed),
            };

            let elapsed = start.elapsed();
            match &pending {
                Pending::Observed(observed) => {
                    tracing::debug!(label = %self.label, attempts, %observed, "not yet converged")
                }
                Pending::Unreachable(message) => {
                    tracing::debug!(label = %self.label, attempts, %message, "service unreachable")
                }
            }

            if elapsed >= self.timeout {
                tracing::warn!(
                    label = %self.label,
                    attempts,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "poll budget exhausted"
                );
                return Err(match pending {
                    Pending::Unreachable(message) => HarnessError::unreachable(format!(
                        "still unreachable after {:?} ({} attempts): {}",
                        self.timeout, attempts, message
                    )),
                    Pending::Observed(last_observed) => HarnessError::ConvergenceTimeout {
                        timeout: self.timeout,
                        attempts,
                        last_observed,
                    },
                });
            }

            // One last attempt lands exactly on the deadline.
            thread::sleep(self.interval.min(self.timeout - elapsed));
        }
    }
}

/// Free-function form of [`Poller::await_convergence`].
pub fn await_convergence<T, F>(predicate: F, interval: Duration, timeout: Duration) -> HarnessResult<T>
where
    F: FnMut() -> HarnessResult<Poll<T>>,
{
    Poller::new(interval, timeout).await_convergence(predicate)
}
