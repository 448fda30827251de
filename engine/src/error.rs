//! Engine error taxonomy with retry classification.
//!
//! A failed round never commits anything, so every round error leaves the
//! same round to be retried on the next tick. The category only decides how
//! loudly the runner reports it.
//!
//! | Category   | Retried next tick | Typical cause                     |
//! |------------|-------------------|-----------------------------------|
//! | Transient  | yes               | backend timeout, 5xx, rate limit  |
//! | Storage    | yes               | disk full, permission flap        |
//! | Fatal      | yes, logged error | bad credentials, rejected request |

use std::fmt;

use thiserror::Error;

use crate::collaborator::TransportError;
use crate::persistence::PersistenceError;
use crate::persona::Persona;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transient,
    Storage,
    Fatal,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::Storage)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Storage => write!(f, "storage"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure of a single `run_round` call.
#[derive(Debug, Error)]
pub enum RoundError {
    /// A persona's model call failed after the client's own retries.
    #[error("model call for {persona} failed: {source}")]
    Transport {
        persona: Persona,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RoundError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transport { source, .. } if source.is_retryable() => RetryCategory::Transient,
            Self::Transport { .. } => RetryCategory::Fatal,
            Self::Persistence(_) => RetryCategory::Storage,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// Short machine-readable tag for status reports and event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Persistence(_) => "persistence",
        }
    }
}

/// Failure opening the engine over a state directory.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load state: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("configuration error: {0}")]
    Configuration(String),
}
