//! Error taxonomy for the device-channel client.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// The result type used throughout the crate.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors produced by the device-channel client.
///
/// The enum is `Clone` because a terminal error is delivered twice: once to
/// the pending-request handler that owns the caller's reply channel, and once
/// to the dispatcher so it can drop the entry.
#[derive(Clone, Debug, Error)]
pub enum AgentError {
    /// Transport-level failure. Every pending request is rejected with this
    /// and the connection manager keeps retrying while the desired state
    /// remains open.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Malformed frame. Logged and dropped; the connection survives.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Server-reported failure for a single command. Carries the `error`
    /// object from the terminal frame and never affects other requests.
    #[error("command failed: {0}")]
    Command(Value),

    /// The keepalive watchdog fired. Surfaced to pending requests as a
    /// connection failure.
    #[error("keepalive timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The connection was explicitly closed while the request was pending.
    #[error("operation cancelled by disconnect")]
    Cancelled,

    /// JSON encoding or decoding failure.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Invariant violation inside the client.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl AgentError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a keepalive timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the failure is transport-level, meaning the operation as a
    /// whole can be retried once the connection recovers. Command and
    /// protocol errors are terminal application failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AgentError::connection("socket reset");
        assert!(matches!(err, AgentError::Connection { .. }));

        let err = AgentError::timeout(Duration::from_secs(10));
        assert!(matches!(err, AgentError::Timeout { .. }));

        let err = AgentError::config("empty url");
        assert!(matches!(err, AgentError::Config { .. }));
    }

    #[test]
    fn test_transport_classification() {
        assert!(AgentError::connection("gone").is_transport());
        assert!(AgentError::timeout(Duration::from_secs(1)).is_transport());
        assert!(AgentError::Cancelled.is_transport());

        assert!(!AgentError::protocol("short frame").is_transport());
        assert!(!AgentError::Command(serde_json::json!({"message": "no"})).is_transport());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<Value>("not json").unwrap_err();
        let err: AgentError = parse_err.into();
        assert!(matches!(err, AgentError::Serialization { .. }));
    }
}
