//! Typed outcomes for bridged operations.

use std::time::Duration;

use thiserror::Error;

/// Why a request did not produce a value.
///
/// `Failed` carries the producer's own error for the matching event; every
/// other variant is raised by the bridge itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError<E> {
    /// The producer reported a failure for this operation
    #[error("operation failed: {0}")]
    Failed(E),

    /// The source went away before the operation resolved
    #[error("source disconnected before the operation completed")]
    Disconnected,

    /// No matching event arrived in time
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The request named a key nobody has attached
    #[error("no entity attached for key {0}")]
    NotFound(String),

    /// The consumer abandoned the operation
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RequestError<E> {
    /// Raised because the source is gone, as opposed to a domain failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestError::Disconnected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::TimedOut(_))
    }
}

impl<E> From<UnknownKey> for RequestError<E> {
    fn from(err: UnknownKey) -> Self {
        RequestError::NotFound(err.0)
    }
}

/// Returned synchronously when an operation names a key with no attached entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no entity attached for key {0}")]
pub struct UnknownKey(pub String);

/// Why a stream stopped yielding values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamEnd {
    #[error("stream cancelled by consumer")]
    Cancelled,

    #[error("source disconnected")]
    Disconnected,

    #[error("capability disabled: {}", .error.as_deref().unwrap_or("turned off"))]
    CapabilityDisabled { error: Option<String> },
}

/// Configuration could not be read from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}
