use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {method} after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("Client not initialized")]
    NotInitialized,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}
