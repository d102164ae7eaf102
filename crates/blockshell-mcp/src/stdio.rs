use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::Child;
use std::process::ChildStdin;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use blockshell_common::mutex_lock_or_recover;
use blockshell_common::rwlock_read_or_recover;
use blockshell_common::rwlock_write_or_recover;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::McpError;
use crate::transport::MessageHandler;
use crate::transport::Transport;

/// How long a child gets to exit after SIGTERM before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long `close` waits for the reader threads before leaving them detached.
const READER_JOIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct ChildState {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_reader: Option<JoinHandle<()>>,
    stderr_drainer: Option<JoinHandle<()>>,
}

/// Runs an MCP server as a child process and talks to it over its standard
/// streams.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    state: Mutex<ChildState>,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            state: Mutex::new(ChildState::default()),
            handler: Arc::new(RwLock::new(None)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        mutex_lock_or_recover(&self.state)
            .child
            .as_ref()
            .map(Child::id)
    }

    fn spawn_stdout_reader(
        &self,
        stdout: impl Read + Send + 'static,
    ) -> std::io::Result<JoinHandle<()>> {
        let handler = Arc::clone(&self.handler);
        let command = self.command.clone();
        thread::Builder::new()
            .name("mcp-stdout".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let message = line.trim_end_matches(['\n', '\r']);
                            if message.is_empty() {
                                continue;
                            }
                            let current = rwlock_read_or_recover(&handler).clone();
                            match current {
                                Some(handle) => handle(message),
                                None => debug!(server = %command, "dropping message, no handler"),
                            }
                        }
                        Err(e) => {
                            debug!(server = %command, error = %e, "stdout read ended");
                            break;
                        }
                    }
                }
            })
    }

    fn spawn_stderr_drainer(
        &self,
        stderr: impl Read + Send + 'static,
    ) -> std::io::Result<JoinHandle<()>> {
        let command = self.command.clone();
        thread::Builder::new()
            .name("mcp-stderr".to_string())
            .spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if line.trim().is_empty() => continue,
                        Ok(line) => warn!(server = %command, "{}", line.trim_end()),
                        Err(_) => break,
                    }
                }
            })
    }
}

impl Transport for StdioTransport {
    fn start(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Transport("transport is closed".to_string()));
        }

        let mut state = mutex_lock_or_recover(&self.state);
        if state.child.is_some() {
            return Ok(());
        }

        // Own process group, so close() can signal anything the server forks.
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn {}: {}", self.command, e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(McpError::Transport("child pipes unavailable".to_string()));
        };

        let threads = self
            .spawn_stdout_reader(stdout)
            .and_then(|reader| Ok((reader, self.spawn_stderr_drainer(stderr)?)));
        let (stdout_reader, stderr_drainer) = match threads {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(McpError::Transport(format!(
                    "failed to start reader threads: {}",
                    e
                )));
            }
        };

        info!(server = %self.command, pid = child.id(), "started MCP server");
        state.child = Some(child);
        state.stdin = Some(stdin);
        state.stdout_reader = Some(stdout_reader);
        state.stderr_drainer = Some(stderr_drainer);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (child, readers) = {
            let mut state = mutex_lock_or_recover(&self.state);
            // Closing stdin is the polite shutdown request for stdio servers.
            drop(state.stdin.take());
            (
                state.child.take(),
                [state.stdout_reader.take(), state.stderr_drainer.take()],
            )
        };

        if let Some(mut child) = child {
            terminate(&mut child, &self.command);
        }
        join_readers(readers.into_iter().flatten(), &self.command);
        info!(server = %self.command, "closed MCP transport");
    }

    fn send(&self, message: &str) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Transport("transport is closed".to_string()));
        }

        let mut state = mutex_lock_or_recover(&self.state);
        let stdin = state
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::Transport("transport not started".to_string()))?;

        let mut framed = String::with_capacity(message.len() + 1);
        framed.push_str(message);
        framed.push('\n');
        stdin
            .write_all(framed.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *rwlock_write_or_recover(&self.handler) = Some(handler);
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn signal_group(child: &Child, signal: libc::c_int) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: the child leads its own process group (process_group(0) at
        // spawn), so -pgid names only it and its descendants.
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

/// SIGTERM the server's process group, wait up to [`TERMINATE_GRACE`] for the
/// server itself, then SIGKILL whatever is left of the group.
fn terminate(child: &mut Child, command: &str) {
    signal_group(child, libc::SIGTERM);

    let deadline = Instant::now() + TERMINATE_GRACE;
    let exited = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(server = %command, ?status, "MCP server exited");
                break true;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Ok(None) => break false,
            Err(e) => {
                warn!(server = %command, error = %e, "failed to poll MCP server");
                break false;
            }
        }
    };

    // Descendants that ignored SIGTERM would keep the output pipes open.
    signal_group(child, libc::SIGKILL);
    if !exited {
        warn!(server = %command, "MCP server ignored SIGTERM, killed");
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn join_readers(handles: impl Iterator<Item = JoinHandle<()>>, command: &str) {
    let deadline = Instant::now() + READER_JOIN_GRACE;
    let mut detached = 0;
    for handle in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            detached += 1;
        }
    }
    if detached > 0 {
        warn!(server = %command, detached, "MCP reader threads still blocked after close");
    }
}
