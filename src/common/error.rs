//! Error types for the session engine
//!
//! Protocol-level failures keep the adapter's error payload so callers can
//! tell an application-level rejection apart from a broken transport.

use std::io;

use serde_json::Value;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the session engine
#[derive(Error, Debug, Clone)]
pub enum Error {
    // === Adapter Errors ===
    #[error("Debug adapter '{name}' not found. Searched: {searched}")]
    AdapterNotFound { name: String, searched: String },

    #[error("Debug adapter failed to start: {0}")]
    AdapterStartFailed(String),

    #[error("Debug adapter crashed unexpectedly")]
    AdapterCrashed,

    // === DAP Protocol Errors ===
    #[error("DAP protocol error: {0}")]
    DapProtocol(String),

    #[error("DAP stream out of sync: {0}")]
    DapFraming(String),

    #[error("DAP request '{command}' failed: {message}")]
    DapRequestFailed {
        command: String,
        message: String,
        body: Option<Value>,
    },

    #[error("Connection to the debug adapter was disposed")]
    ConnectionDisposed,

    // === Session Errors ===
    #[error("Unsupported request type '{0}'. Use 'launch' or 'attach'")]
    UnsupportedRequest(String),

    #[error("Debug session '{0}' not found")]
    SessionNotFound(String),

    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    #[error("Failed to start terminal: {0}")]
    TerminalFailed(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(String),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(String),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl Error {
    /// Create an adapter not found error with search paths
    pub fn adapter_not_found<S: AsRef<str>>(name: &str, paths: &[S]) -> Self {
        Self::AdapterNotFound {
            name: name.to_string(),
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Create a DAP request failed error
    pub fn dap_request_failed(command: &str, message: &str, body: Option<Value>) -> Self {
        Self::DapRequestFailed {
            command: command.to_string(),
            message: message.to_string(),
            body,
        }
    }

    /// The adapter's error payload, if this is a rejected request
    pub fn response_body(&self) -> Option<&Value> {
        match self {
            Self::DapRequestFailed { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_failed_keeps_body() {
        let err = Error::dap_request_failed(
            "evaluate",
            "not available",
            Some(json!({ "error": { "id": 3 } })),
        );
        assert_eq!(err.to_string(), "DAP request 'evaluate' failed: not available");
        assert_eq!(err.response_body(), Some(&json!({ "error": { "id": 3 } })));
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken").into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("pipe broken")));
    }

    #[test]
    fn test_adapter_not_found_lists_paths() {
        let err = Error::adapter_not_found("lldb-dap", &["/usr/bin", "/opt/llvm/bin"]);
        assert!(err.to_string().contains("/usr/bin, /opt/llvm/bin"));
    }
}
