#![deny(clippy::all)]

mod error;
mod executor;
mod utf8;

pub use error::PtyError;
pub use executor::COMMAND_NOT_FOUND_EXIT;
pub use executor::DEFAULT_COLS;
pub use executor::DEFAULT_ROWS;
pub use executor::DEFAULT_SHELL;
pub use executor::ExecutionResult;
pub use executor::Executor;
pub use executor::StreamOptions;
pub use executor::TERMINATED_ABNORMALLY;
