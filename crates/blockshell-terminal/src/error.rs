use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to read from PTY: {0}")]
    Read(String),
    #[error("Failed to wait for process: {0}")]
    Wait(String),
}

impl PtyError {
    /// Returns the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            PtyError::Open(_) => "open",
            PtyError::Spawn(_) => "spawn",
            PtyError::Read(_) => "read",
            PtyError::Wait(_) => "wait",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open(r) | PtyError::Spawn(r) | PtyError::Read(r) | PtyError::Wait(r) => r,
        }
    }
}
