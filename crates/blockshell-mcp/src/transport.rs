use std::sync::Arc;

use crate::error::McpError;

/// Invoked once per inbound message, from the transport's reader thread.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A duplex, line-oriented message channel.
///
/// Implementations use interior mutability: a transport is shared between the
/// thread issuing calls and the thread delivering inbound messages.
pub trait Transport: Send + Sync {
    /// Begin delivering inbound messages. Starting twice is a no-op.
    fn start(&self) -> Result<(), McpError>;

    /// Stop the transport and release its resources. Idempotent.
    fn close(&self);

    /// Send one message. `message` must not contain a newline.
    fn send(&self, message: &str) -> Result<(), McpError>;

    fn set_message_handler(&self, handler: MessageHandler);
}
