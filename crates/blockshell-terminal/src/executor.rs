//! Runs shell commands, either to completion or streamed through a PTY.

use std::io;
use std::io::Read;
use std::process::Command;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tracing::debug;
use tracing::error;

use crate::error::PtyError;
use crate::utf8::Utf8Carry;

pub const DEFAULT_SHELL: &str = "/bin/bash";
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Exit code reported when the shell itself could not be started.
pub const COMMAND_NOT_FOUND_EXIT: i32 = 127;

/// Exit code reported when the child did not exit normally (signalled, or the
/// PTY could not be set up).
pub const TERMINATED_ABNORMALLY: i32 = -1;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub cwd: String,
    pub shell: String,
    pub cols: i64,
    pub rows: i64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            cwd: String::new(),
            shell: DEFAULT_SHELL.to_string(),
            cols: DEFAULT_COLS as i64,
            rows: DEFAULT_ROWS as i64,
        }
    }
}

impl StreamOptions {
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_size(mut self, cols: i64, rows: i64) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    fn pty_size(&self) -> PtySize {
        let clamp = |v: i64, default: u16| {
            if v <= 0 {
                default
            } else {
                u16::try_from(v).unwrap_or(u16::MAX)
            }
        };
        PtySize {
            rows: clamp(self.rows, DEFAULT_ROWS),
            cols: clamp(self.cols, DEFAULT_COLS),
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// `bash` is started interactively so aliases and profile settings apply.
    fn shell_args<'a>(&self, command: &'a str) -> Vec<&'a str> {
        if self.shell.contains("bash") {
            vec!["-i", "-c", command]
        } else {
            vec!["-c", command]
        }
    }

    fn effective_cwd(&self) -> Option<&str> {
        match self.cwd.as_str() {
            "" | "." => None,
            dir => Some(dir),
        }
    }
}

/// Stateless command runner. Held by value wherever commands are executed so
/// tests can construct their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` under `/bin/bash -c` to completion, capturing stdout and
    /// stderr separately.
    pub fn execute(&self, command: &str) -> ExecutionResult {
        let output = match Command::new(DEFAULT_SHELL).arg("-c").arg(command).output() {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "failed to spawn shell");
                return ExecutionResult {
                    exit_code: COMMAND_NOT_FOUND_EXIT,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    success: false,
                };
            }
        };

        let exit_code = output.status.code().unwrap_or(TERMINATED_ABNORMALLY);
        ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: exit_code == 0,
        }
    }

    /// Run `command` attached to a fresh PTY and stream its output.
    ///
    /// The PTY merges both output streams, so every byte goes to `on_stdout`;
    /// `on_stderr` is accepted for symmetry with [`Executor::execute`] and is
    /// never called. Returns the exit code, [`COMMAND_NOT_FOUND_EXIT`] when the
    /// shell could not be spawned, or [`TERMINATED_ABNORMALLY`] otherwise.
    pub fn execute_stream<O, E>(
        &self,
        command: &str,
        options: &StreamOptions,
        on_stdout: O,
        _on_stderr: E,
    ) -> i32
    where
        O: FnMut(&[u8]),
        E: FnMut(&[u8]),
    {
        match self.try_execute_stream(command, options, on_stdout) {
            Ok(code) => code,
            Err(e @ PtyError::Spawn(_)) => {
                error!(error = %e, shell = %options.shell, "failed to start command");
                COMMAND_NOT_FOUND_EXIT
            }
            Err(e) => {
                error!(error = %e, operation = e.operation(), "pty execution failed");
                TERMINATED_ABNORMALLY
            }
        }
    }

    fn try_execute_stream<O>(
        &self,
        command: &str,
        options: &StreamOptions,
        mut on_stdout: O,
    ) -> Result<i32, PtyError>
    where
        O: FnMut(&[u8]),
    {
        let pair = native_pty_system()
            .openpty(options.pty_size())
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(options.shell_args(command));
        if let Some(dir) = options.effective_cwd() {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env("CLICOLOR", "1");
        cmd.env("FORCE_COLOR", "1");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Only the child may hold the slave side, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        debug!(pid = ?pid, command, "spawned pty command");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut carry = Utf8Carry::default();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let ready = carry.push(&buf[..n]);
                    if !ready.is_empty() {
                        on_stdout(&ready);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(e) => {
                    let tail = carry.finish();
                    if !tail.is_empty() {
                        on_stdout(&tail);
                    }
                    wait_for_exit(pid)?;
                    return Err(PtyError::Read(e.to_string()));
                }
            }
        }

        let tail = carry.finish();
        if !tail.is_empty() {
            on_stdout(&tail);
        }

        let code = wait_for_exit(pid)?;
        drop(child);
        drop(pair.master);
        Ok(code)
    }
}

/// Reap the child and translate its status. Normal exit yields the exit code;
/// anything else yields [`TERMINATED_ABNORMALLY`].
fn wait_for_exit(pid: Option<u32>) -> Result<i32, PtyError> {
    let pid = pid.ok_or_else(|| PtyError::Wait("child has no pid".to_string()))?;
    let pid = libc::pid_t::try_from(pid).map_err(|e| PtyError::Wait(e.to_string()))?;

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid is called with a pid we spawned and a valid status pointer
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(PtyError::Wait(err.to_string()));
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else {
        Ok(TERMINATED_ABNORMALLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> StreamOptions {
        StreamOptions::default().with_shell("/bin/sh")
    }

    fn stream(command: &str, options: &StreamOptions) -> (i32, String) {
        let mut out = Vec::new();
        let code = Executor::new().execute_stream(
            command,
            options,
            |data| out.extend_from_slice(data),
            |_| panic!("pty output must not be routed to stderr"),
        );
        (code, String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn test_execute_captures_stdout() {
        let result = Executor::new().execute("echo hello");
        assert_eq!(result.exit_code, 0);
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_execute_separates_stderr() {
        let result = Executor::new().execute("echo oops >&2; exit 3");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, "oops\n");
    }

    #[test]
    fn test_execute_unknown_command_is_127() {
        let result = Executor::new().execute("definitely-not-a-command-blockshell");
        assert_eq!(result.exit_code, 127);
        assert!(!result.success);
    }

    #[test]
    fn test_execute_signalled_child_is_abnormal() {
        let result = Executor::new().execute("kill -9 $$");
        assert_eq!(result.exit_code, TERMINATED_ABNORMALLY);
    }

    #[test]
    fn test_stream_delivers_output_and_exit_code() {
        let (code, out) = stream("echo streamed; exit 7", &sh());
        assert_eq!(code, 7);
        assert!(out.contains("streamed"), "output was {:?}", out);
    }

    #[test]
    fn test_stream_merges_stderr_into_stdout() {
        let (code, out) = stream("echo to-stderr >&2", &sh());
        assert_eq!(code, 0);
        assert!(out.contains("to-stderr"));
    }

    #[test]
    fn test_stream_sets_terminal_environment() {
        let (_, out) = stream("echo $TERM:$FORCE_COLOR", &sh());
        assert!(out.contains("xterm-256color:1"), "output was {:?}", out);
    }

    #[test]
    fn test_stream_changes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let options = sh().with_cwd(canonical.to_string_lossy());
        let (code, out) = stream("pwd -P", &options);
        assert_eq!(code, 0);
        assert!(out.contains(canonical.to_str().unwrap()), "output was {:?}", out);
    }

    #[test]
    fn test_stream_applies_size() {
        let options = sh().with_size(100, 30);
        let (_, out) = stream("stty size", &options);
        assert!(out.contains("30 100"), "output was {:?}", out);
    }

    #[test]
    fn test_stream_non_positive_size_uses_defaults() {
        let options = sh().with_size(0, -5);
        let (_, out) = stream("stty size", &options);
        assert!(out.contains("24 80"), "output was {:?}", out);
    }

    #[test]
    fn test_stream_missing_shell_is_127() {
        let options = StreamOptions::default().with_shell("/nonexistent/blockshell-shell");
        let (code, out) = stream("echo never", &options);
        assert_eq!(code, COMMAND_NOT_FOUND_EXIT);
        assert!(out.is_empty());
    }

    #[test]
    fn test_stream_signalled_child_is_abnormal() {
        let (code, _) = stream("kill -9 $$", &sh());
        assert_eq!(code, TERMINATED_ABNORMALLY);
    }

    #[test]
    fn test_shell_args_interactive_only_for_bash() {
        let bash = StreamOptions::default();
        assert_eq!(bash.shell_args("ls"), vec!["-i", "-c", "ls"]);
        assert_eq!(sh().shell_args("ls"), vec!["-c", "ls"]);
    }

    #[test]
    fn test_effective_cwd_ignores_empty_and_dot() {
        assert_eq!(sh().effective_cwd(), None);
        assert_eq!(sh().with_cwd(".").effective_cwd(), None);
        assert_eq!(sh().with_cwd("/tmp").effective_cwd(), Some("/tmp"));
    }
}
