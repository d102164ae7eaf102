use blockshell_common::error_codes::{self, ErrorCategory, category_for_code};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Failed to serialize request: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("RPC error ({code}): {message}")]
    RpcError { code: i32, message: String },

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Connection closed by daemon")]
    ConnectionClosed,

    #[error("Invalid response from daemon")]
    InvalidResponse,
}

impl ClientError {
    /// Category of an error reported by the daemon; `None` for local failures.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ClientError::RpcError { code, .. } => Some(category_for_code(*code)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ConnectionFailed(_) | ClientError::ConnectionClosed => true,
            other => other.category().is_some_and(|c| c.is_retryable()),
        }
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ClientError::ConnectionFailed(_) | ClientError::DaemonNotRunning => {
                Some("Start the daemon with `blockshell daemon`, or check BLOCKSHELL_SOCKET.")
            }
            ClientError::ConnectionClosed => Some("The daemon may have exited; check its log."),
            ClientError::RpcError { code, .. } if *code == error_codes::METHOD_NOT_FOUND => {
                Some("The daemon does not know this method; check the daemon version.")
            }
            _ => None,
        }
    }
}
