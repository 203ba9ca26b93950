use std::time::Duration;

use crate::resolver::Capability;
use crate::version::ServiceVersion;

/// All errors the harness primitives and scenarios can return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarnessError {
    /// Transport-level failure talking to the service. Retried by the
    /// poller up to its timeout; anywhere else it aborts the run.
    #[error("service unreachable: {message}")]
    Unreachable { message: String },

    /// Malformed or unexpected response shape, or a violated invariant.
    /// Stops the current poll immediately.
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// The capability table has no entry at or below the given version.
    #[error("capability {capability} is not available on version {version}")]
    UnsupportedCapability {
        capability: Capability,
        version: ServiceVersion,
    },

    /// A migration command neither performed work nor was a recognized no-op.
    #[error("migration of {resource} failed: {message}")]
    MigrationFailed { resource: String, message: String },

    /// The poller budget ran out before the predicate converged.
    #[error(
        "no convergence after {attempts} attempts within {timeout:?}; last observed: {last_observed}"
    )]
    ConvergenceTimeout {
        timeout: Duration,
        attempts: u32,
        last_observed: String,
    },

    /// Invalid phase, version or settings input.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl HarnessError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        HarnessError::Unreachable {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HarnessError::Fatal {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        HarnessError::Config {
            message: message.into(),
        }
    }

    /// True for errors that should abort the whole run rather than just the
    /// scenario that produced them.
    pub fn aborts_run(&self) -> bool {
        matches!(self, HarnessError::Unreachable { .. })
    }
}

/// Result alias used across the harness.
pub type HarnessResult<T> = Result<T, HarnessError>;
