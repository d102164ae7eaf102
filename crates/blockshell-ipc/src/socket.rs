use std::path::PathBuf;

pub const SOCKET_ENV: &str = "BLOCKSHELL_SOCKET";

pub fn socket_path() -> PathBuf {
    if let Ok(custom_path) = std::env::var(SOCKET_ENV) {
        if !custom_path.is_empty() {
            return PathBuf::from(custom_path);
        }
    }

    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("blockshell.sock"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/blockshell.sock"))
}
