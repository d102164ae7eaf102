#![deny(clippy::all)]

mod client;
mod error;
mod socket;
mod types;

pub use blockshell_common::error_codes;

pub use client::DaemonClient;
pub use error::ClientError;
pub use socket::SOCKET_ENV;
pub use socket::socket_path;
pub use types::JSONRPC_VERSION;
pub use types::RpcNotification;
pub use types::RpcRequest;
pub use types::RpcResponse;
pub use types::RpcServerError;
pub use types::ServerMessage;

pub type Result<T> = std::result::Result<T, ClientError>;
