use std::collections::VecDeque;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::error::ClientError;
use crate::socket::socket_path;
use crate::types::RpcNotification;
use crate::types::RpcRequest;
use crate::types::ServerMessage;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A persistent connection to the daemon.
///
/// The daemon broadcasts notifications to every connected client, so while a
/// call is waiting for its response any notifications that arrive first are
/// queued and handed out later by [`DaemonClient::next_notification`].
pub struct DaemonClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
    queued: VecDeque<RpcNotification>,
}

impl DaemonClient {
    pub fn connect() -> Result<Self, ClientError> {
        Self::connect_to(&socket_path())
    }

    pub fn connect_to(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            return Err(ClientError::DaemonNotRunning);
        }

        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(DEFAULT_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(DEFAULT_WRITE_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);

        Ok(Self {
            reader,
            writer: stream,
            next_id: 1,
            queued: VecDeque::new(),
        })
    }

    pub fn is_daemon_running_at(path: &Path) -> bool {
        path.exists() && UnixStream::connect(path).is_ok()
    }

    pub fn is_daemon_running() -> bool {
        Self::is_daemon_running_at(&socket_path())
    }

    pub fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RpcRequest::new(id, method, params.unwrap_or_else(|| serde_json::json!({})));
        let request_json = serde_json::to_string(&request)?;
        writeln!(self.writer, "{}", request_json)?;
        self.writer.flush()?;

        loop {
            match self.read_message()? {
                ServerMessage::Notification(note) => self.queued.push_back(note),
                ServerMessage::Response(response) => {
                    if response.id.as_u64() != Some(id) {
                        continue;
                    }
                    if let Some(error) = response.error {
                        return Err(ClientError::RpcError {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return response.result.ok_or(ClientError::InvalidResponse);
                }
            }
        }
    }

    /// Wait for the next broadcast notification.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first.
    pub fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RpcNotification>, ClientError> {
        if let Some(note) = self.queued.pop_front() {
            return Ok(Some(note));
        }

        self.writer
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let result = loop {
            match self.read_message() {
                Ok(ServerMessage::Notification(note)) => break Ok(Some(note)),
                Ok(ServerMessage::Response(_)) => continue,
                Err(ClientError::ConnectionFailed(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    break Ok(None);
                }
                Err(e) => break Err(e),
            }
        };
        self.writer.set_read_timeout(Some(DEFAULT_READ_TIMEOUT))?;
        result
    }

    fn read_message(&mut self) -> Result<ServerMessage, ClientError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return ServerMessage::parse(trimmed).map_err(|_| ClientError::InvalidResponse);
        }
    }
}
