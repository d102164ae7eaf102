//! Client side of the Model Context Protocol.
//!
//! A [`Client`] speaks JSON-RPC 2.0 over any [`Transport`]; the shipped
//! transport is [`StdioTransport`], which runs the tool server as a child
//! process and exchanges one JSON message per line over its stdin/stdout.

#![deny(clippy::all)]

mod client;
mod error;
mod stdio;
mod transport;
mod types;

pub use client::CALL_TIMEOUT;
pub use client::Client;
pub use client::PROTOCOL_VERSION;
pub use error::McpError;
pub use stdio::StdioTransport;
pub use transport::MessageHandler;
pub use transport::Transport;
pub use types::Tool;
pub use types::ToolResult;
