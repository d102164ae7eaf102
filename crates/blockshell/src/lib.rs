#![deny(clippy::all)]

pub mod commands;
pub mod handlers;
pub mod text;

pub use commands::Cli;
pub use commands::Commands;
pub use commands::OutputFormat;
pub use handlers::HandlerContext;
pub use handlers::HandlerResult;
