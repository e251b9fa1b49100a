//! Error types for sandlink-core.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandlink-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Outcome of waiting on an asynchronous operation.
///
/// This type is `Clone` so the monitor can hand the same outcome to every
/// waiter of a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The deadline passed before a terminal event arrived.
    #[error("operation timed out after {after:?}{}", last_seen(.last_message))]
    Timeout {
        /// The timeout that was exceeded.
        after: Duration,
        /// Last progress message received, if any.
        last_message: Option<String>,
    },

    /// The server reported the operation as failed.
    #[error("operation failed: {message}")]
    Failed {
        /// Server-provided failure message, verbatim.
        message: String,
    },

    /// The event stream closed before a terminal event.
    #[error("event stream ended without completion{}", last_seen(.last_message))]
    StreamEndedWithoutCompletion {
        /// Last progress message received, if any.
        last_message: Option<String>,
    },

    /// The caller cancelled the wait.
    #[error("operation wait cancelled")]
    Cancelled,

    /// The event stream could not be opened or read.
    #[error("event stream transport error: {0}")]
    Transport(String),

    /// The event endpoint answered with a non-success status.
    #[error("event stream API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },
}

fn last_seen(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(" (last progress: {m})"),
        None => String::new(),
    }
}

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection or protocol failure talking to the control plane
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the control plane
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Message from the server
        message: String,
    },

    /// An asynchronous operation did not complete successfully
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Tunnel executable could not be located
    #[error("executable '{name}' not found; searched:\n{}", format_searched(.searched))]
    ExecutableNotFound {
        /// Binary name that was looked up
        name: String,
        /// Every candidate path that was checked
        searched: Vec<PathBuf>,
    },

    /// No tunnel with this id is registered
    #[error("tunnel not found: {0}")]
    TunnelNotFound(u64),

    /// Tunnel process exited right after spawning
    #[error("tunnel process exited immediately: {0}")]
    TunnelExited(String),

    /// SSH config document could not be split into host blocks
    #[error("SSH config corrupted ({path}): {reason}")]
    ConfigCorruption {
        /// File the document was read from
        path: PathBuf,
        /// What made it unparseable
        reason: String,
    },

    /// Host block not present in the SSH config
    #[error("SSH host not found: {0}")]
    HostNotFound(String),

    /// Host block already present in the SSH config
    #[error("SSH host already exists: {0}")]
    HostExists(String),

    /// Invalid lifecycle state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state(s)
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Transport(e.to_string())
    }
}

impl CoreError {
    /// Whether the failure is a transport error worth retrying for idempotent calls.
    pub fn is_transport(&self) -> bool {
        matches!(self, CoreError::Transport(_))
    }
}

fn format_searched(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_includes_last_progress() {
        let err = OperationError::Timeout {
            after: Duration::from_secs(1),
            last_message: Some("pulling image".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("1s"));
        assert!(msg.contains("last progress: pulling image"));
    }

    #[test]
    fn test_stream_ended_without_progress() {
        let err = OperationError::StreamEndedWithoutCompletion { last_message: None };
        assert_eq!(err.to_string(), "event stream ended without completion");
    }

    #[test]
    fn test_executable_not_found_lists_locations() {
        let err = CoreError::ExecutableNotFound {
            name: "sandlink-tunnel".into(),
            searched: vec![PathBuf::from("/a/sandlink-tunnel"), PathBuf::from("/b/sandlink-tunnel")],
        };
        let msg = err.to_string();
        assert!(msg.contains("'sandlink-tunnel' not found"));
        assert!(msg.contains("  - /a/sandlink-tunnel"));
        assert!(msg.contains("  - /b/sandlink-tunnel"));
    }
}
