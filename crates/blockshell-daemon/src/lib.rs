#![deny(clippy::all)]

mod config;
mod error;
mod execution;
pub mod handlers;
mod lock_file;
mod mcp_registry;
mod notifications;
mod pool;
pub mod rpc;
mod server;
mod signal_handler;
pub mod store;

pub use config::DATA_DIR_ENV;
pub use config::DaemonConfig;
pub use error::DaemonError;
pub use error::HandlerError;
pub use error::PersistenceError;
pub use execution::execute_to_block;
pub use lock_file::LockFile;
pub use mcp_registry::McpRegistry;
pub use mcp_registry::McpServerSummary;
pub use notifications::NotificationRelay;
pub use pool::Job;
pub use pool::JobRejected;
pub use pool::JobRunner;
pub use pool::ThreadPool;
pub use server::Daemon;
pub use server::start_daemon;
pub use signal_handler::SignalHandler;
