use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use blockshell_ipc::socket_path;
use tracing::warn;

const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_MAX_JOBS: usize = 16;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 0;
const DEFAULT_MAX_REQUEST_BYTES: usize = 1_048_576; // 1MB
const DEFAULT_CLIENT_WRITE_TIMEOUT_SECS: u64 = 5;

pub const DATA_DIR_ENV: &str = "BLOCKSHELL_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub max_jobs: usize,
    /// Zero disables the per-connection read timeout; clients that only
    /// listen for notifications stay connected indefinitely.
    pub idle_timeout: Duration,
    pub max_request_bytes: usize,
    pub client_write_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            socket_path: socket_path(),
            data_dir: default_data_dir(),
            max_connections: env_or("BLOCKSHELL_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS).max(1),
            max_jobs: env_or("BLOCKSHELL_MAX_JOBS", DEFAULT_MAX_JOBS).max(1),
            idle_timeout: Duration::from_secs(env_or(
                "BLOCKSHELL_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            client_write_timeout: Duration::from_secs(DEFAULT_CLIENT_WRITE_TIMEOUT_SECS),
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_max_jobs(mut self, max: usize) -> Self {
        self.max_jobs = max.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.socket_path.with_extension("lock")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// `None` when idle timeouts are disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        if self.idle_timeout.is_zero() {
            None
        } else {
            Some(self.idle_timeout)
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("blockshell");
    }
    match env::var_os("HOME").filter(|d| !d.is_empty()) {
        Some(home) => PathBuf::from(home).join(".local/share/blockshell"),
        None => env::temp_dir().join("blockshell"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::from_env()
            .with_socket_path("/tmp/x.sock")
            .with_data_dir("/tmp/data");
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/x.lock"));
        assert_eq!(config.sessions_file(), PathBuf::from("/tmp/data/sessions.json"));
        assert_eq!(config.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert_eq!(
            config.client_write_timeout,
            Duration::from_secs(DEFAULT_CLIENT_WRITE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_builder_pattern() {
        let config = DaemonConfig::from_env()
            .with_max_connections(8)
            .with_max_jobs(0)
            .with_idle_timeout(Duration::from_secs(30))
            .with_max_request_bytes(2048);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_jobs, 1);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_request_bytes, 2048);
    }

    #[test]
    fn test_zero_idle_timeout_disables_read_timeout() {
        let config = DaemonConfig::from_env().with_idle_timeout(Duration::ZERO);
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        assert_eq!(env_or::<usize>("BLOCKSHELL_TEST_UNSET_VARIABLE", 7), 7);
    }
}
