//! Error types for the Tether plugin framework.
//!
//! Lifecycle operations (binding ports, spawning processes, querying plugin
//! metadata, dialing the host) return these errors to their direct caller.
//! Function-call routing never does: routing failures travel inside a
//! [`CallResponse`](crate::rpc::CallResponse) with an error code instead.

use crate::registry::PluginStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Tether framework.
#[derive(Debug, Error)]
pub enum TetherError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to {addr} lost")]
    ConnectionLost { addr: String },

    #[error("No available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Remote call failed [{code}]: {message}")]
    Rpc { code: i32, message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Plugin lifecycle errors
    #[error("Plugin {id} does not exist")]
    PluginNotFound { id: String },

    #[error("Plugin {id} already exists for {path:?}")]
    PluginAlreadyExists { id: String, path: PathBuf },

    #[error("Plugin {id} is already running")]
    PluginAlreadyRunning { id: String },

    #[error("Plugin {id} is not running (status: {status})")]
    PluginNotRunning { id: String, status: PluginStatus },

    #[error("Plugin {id} has no live connection")]
    PluginNotConnected { id: String },

    #[error("Plugin {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: PluginStatus,
        to: PluginStatus,
    },

    #[error("Failed to launch plugin {path:?}: {message}")]
    LaunchFailed { path: PathBuf, message: String },

    #[error("Failed to query plugin metadata from {path:?}: {message}")]
    MetadataQuery { path: PathBuf, message: String },

    #[error("Registration rejected: {message}")]
    RegistrationRejected { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TetherError {
    /// Create an IO error with a contextual message.
    pub fn io_with_context(err: std::io::Error, context: impl Into<String>) -> Self {
        TetherError::Io {
            message: format!("{}: {}", context.into(), err),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Plugin not found
    /// - -32002: Plugin not running or not connected
    /// - -32003: Launch or metadata failure
    /// - -32004: Cancelled
    /// - -32005: Validation error
    /// - -32006: Registration rejected
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TetherError::Json { .. } => -32700,

            TetherError::MethodNotFound { .. } => -32601,

            TetherError::Io { .. }
            | TetherError::Timeout(_)
            | TetherError::ConnectionLost { .. }
            | TetherError::NoAvailablePort { .. } => -32000,

            TetherError::PluginNotFound { .. } => -32001,

            TetherError::PluginNotRunning { .. }
            | TetherError::PluginNotConnected { .. }
            | TetherError::PluginAlreadyRunning { .. } => -32002,

            TetherError::LaunchFailed { .. } | TetherError::MetadataQuery { .. } => -32003,

            TetherError::Cancelled => -32004,

            TetherError::Validation { .. } | TetherError::InvalidTransition { .. } => -32005,

            TetherError::RegistrationRejected { .. } => -32006,

            TetherError::Rpc { code, .. } => *code,

            _ => -32603,
        }
    }

    /// Check if this error describes a transient link failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TetherError::Io { .. } | TetherError::Timeout(_) | TetherError::ConnectionLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::PluginNotFound {
            id: "ghost".into(),
        };
        assert_eq!(err.to_string(), "Plugin ghost does not exist");

        let err = TetherError::NoAvailablePort {
            start: 50051,
            end: 50051,
        };
        assert_eq!(err.to_string(), "No available port in range 50051-50051");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            TetherError::MethodNotFound {
                method: "Nope".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            TetherError::PluginNotFound { id: "x".into() }.to_rpc_error_code(),
            -32001
        );
        assert_eq!(
            TetherError::Rpc {
                code: -32042,
                message: "remote".into()
            }
            .to_rpc_error_code(),
            -32042
        );
        assert_eq!(TetherError::Other("boom".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TetherError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(TetherError::ConnectionLost {
            addr: "127.0.0.1:1".into()
        }
        .is_retryable());
        assert!(!TetherError::PluginNotFound { id: "x".into() }.is_retryable());
    }
}
