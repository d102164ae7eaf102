//! Process-wide `tracing` setup shared by the daemon and the CLI.

use std::ffi::OsString;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Names a file that log lines are appended to instead of stderr.
pub const LOG_ENV: &str = "BLOCKSHELL_LOG";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

impl LogTarget {
    pub fn from_env() -> Self {
        Self::from_value(std::env::var_os(LOG_ENV))
    }

    fn from_value(value: Option<OsString>) -> Self {
        match value {
            Some(path) if !path.is_empty() => Self::File(PathBuf::from(path)),
            _ => Self::Stderr,
        }
    }
}

/// Owns the background log writer. Buffered lines are flushed when it drops,
/// so keep it alive until the process is done logging.
#[must_use]
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    _writer: Option<WorkerGuard>,
}

struct Sink {
    writer: BoxMakeWriter,
    ansi: bool,
    guard: Option<WorkerGuard>,
}

impl Sink {
    fn stderr() -> Self {
        Self {
            writer: BoxMakeWriter::new(std::io::stderr),
            ansi: std::io::stderr().is_terminal(),
            guard: None,
        }
    }

    /// Log files never get colour codes. Falls back to stderr when the file
    /// cannot be opened.
    fn open(target: &LogTarget) -> Self {
        let LogTarget::File(path) = target else {
            return Self::stderr();
        };
        match open_log_file(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                Self {
                    writer: BoxMakeWriter::new(writer),
                    ansi: false,
                    guard: Some(guard),
                }
            }
            Err(e) => {
                eprintln!("blockshell: cannot open log file {}: {}", path.display(), e);
                Self::stderr()
            }
        }
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. `RUST_LOG` picks the filter, with
/// `default_level` used when it is unset or unparsable. Only the first call
/// in a process installs anything; later calls return an empty guard.
pub fn init_tracing(default_level: &str) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let sink = Sink::open(&LogTarget::from_env());

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_ansi(sink.ansi)
        .with_writer(sink.writer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        _writer: if installed { sink.guard } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_target_from_value() {
        assert_eq!(LogTarget::from_value(None), LogTarget::Stderr);
        assert_eq!(LogTarget::from_value(Some(OsString::new())), LogTarget::Stderr);
        assert_eq!(
            LogTarget::from_value(Some(OsString::from("/tmp/blockshell.log"))),
            LogTarget::File(PathBuf::from("/tmp/blockshell.log"))
        );
    }

    #[test]
    fn test_file_sink_creates_parent_and_disables_ansi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("daemon.log");

        let sink = Sink::open(&LogTarget::File(path.clone()));
        assert!(!sink.ansi);
        assert!(sink.guard.is_some());
        assert!(path.exists());
    }

    #[test]
    fn test_unopenable_file_falls_back_to_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Sink::open(&LogTarget::File(dir.path().to_path_buf()));
        assert!(sink.guard.is_none());
    }

    #[test]
    fn test_second_init_is_harmless() {
        let _first = init_tracing("warn");
        let second = init_tracing("debug");
        assert!(second._writer.is_none());
    }
}
