//! Errors raised inside the daemon.
//!
//! `HandlerError` is what RPC handlers return; the dispatcher turns it into a
//! JSON-RPC error object. Everything but invalid params is reported as a
//! generic handler failure carrying the error text.

use blockshell_common::error_codes::{self, ErrorCategory};
use blockshell_mcp::McpError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Mcp(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn missing_param(key: &str) -> Self {
        HandlerError::InvalidParams(format!("Missing '{}' param", key))
    }

    /// Returns the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            HandlerError::InvalidParams(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::HANDLER_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::InvalidParams(_) => ErrorCategory::InvalidInput,
            HandlerError::NotFound(_) => ErrorCategory::NotFound,
            HandlerError::Io(_) => ErrorCategory::External,
            HandlerError::Mcp(_) => ErrorCategory::External,
            HandlerError::Failed(_) => ErrorCategory::Internal,
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Io(err.to_string())
    }
}

impl From<McpError> for HandlerError {
    fn from(err: McpError) -> Self {
        HandlerError::Mcp(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize sessions: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Daemon startup errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind socket: {0}")]
    SocketBind(String),
    #[error("Another daemon instance is already running")]
    AlreadyRunning,
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(String),
}

impl DaemonError {
    /// Returns a helpful suggestion for resolving the error.
    pub fn suggestion(&self) -> String {
        match self {
            DaemonError::SocketBind(_) => {
                "Check that the socket directory exists and is writable, or set BLOCKSHELL_SOCKET."
                    .to_string()
            }
            DaemonError::AlreadyRunning => {
                "A daemon is already serving this socket. Use it, or pick another socket path."
                    .to_string()
            }
            DaemonError::LockFailed(_) => {
                "Check permissions on the lock file next to the socket.".to_string()
            }
            DaemonError::SignalSetup(_) | DaemonError::ThreadPool(_) => {
                "Check system resource limits (ulimit -u) and try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_codes() {
        assert_eq!(
            HandlerError::missing_param("block_id").code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            HandlerError::NotFound("Block not found".into()).code(),
            error_codes::HANDLER_ERROR
        );
        assert_eq!(
            HandlerError::Failed("boom".into()).code(),
            error_codes::HANDLER_ERROR
        );
    }

    #[test]
    fn test_handler_error_message_is_plain_text() {
        let err = HandlerError::NotFound("Block not found".into());
        assert_eq!(err.to_string(), "Block not found");
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(
            HandlerError::missing_param("path").to_string(),
            "Missing 'path' param"
        );
    }

    #[test]
    fn test_handler_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = HandlerError::from(io);
        assert_eq!(err.category(), ErrorCategory::External);
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_daemon_error_suggestions() {
        assert!(DaemonError::AlreadyRunning.suggestion().contains("already"));
        assert!(DaemonError::SocketBind("x".into())
            .suggestion()
            .contains("BLOCKSHELL_SOCKET"));
    }
}
