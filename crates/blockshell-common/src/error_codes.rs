//! JSON-RPC error codes used on the daemon socket.

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// A handler failed; the message carries the failure text.
pub const HANDLER_ERROR: i32 = -32000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    InvalidInput,
    Internal,
    External,
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
            ErrorCategory::Timeout => "timeout",
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::External | ErrorCategory::Timeout)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Best-effort category for a code seen on the wire, where only the number
/// survives.
pub fn category_for_code(code: i32) -> ErrorCategory {
    match code {
        METHOD_NOT_FOUND => ErrorCategory::NotFound,
        PARSE_ERROR | INVALID_REQUEST | INVALID_PARAMS => ErrorCategory::InvalidInput,
        HANDLER_ERROR => ErrorCategory::External,
        _ => ErrorCategory::Internal,
    }
}
