use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use blockshell_common::mutex_lock_or_recover;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Request exceeds size limit of {max_bytes} bytes")]
    SizeLimit { max_bytes: usize },
    #[error("Connection timeout")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        }
    }
}

/// Line reader that refuses to buffer more than `max_size` bytes for a
/// single line.
struct SizeLimitedReader<R> {
    inner: R,
    max_size: usize,
}

impl<R: BufRead> SizeLimitedReader<R> {
    fn new(inner: R, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let mut buf = Vec::new();
        let limit = self.max_size as u64 + 1;
        let n = (&mut self.inner).take(limit).read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if n as u64 >= limit {
            return Err(TransportError::SizeLimit {
                max_bytes: self.max_size,
            });
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| TransportError::Parse(e.to_string()))
    }
}

/// Write half of a client connection, shared between the connection's own
/// thread (responses) and broadcasters (notifications). The mutex keeps whole
/// lines from interleaving.
pub struct ClientWriter {
    stream: Mutex<UnixStream>,
}

impl ClientWriter {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    pub fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let mut stream = mutex_lock_or_recover(&self.stream);
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Wake a reader blocked on this socket and refuse further traffic.
    pub fn shutdown(&self) {
        let stream = mutex_lock_or_recover(&self.stream);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

pub struct UnixSocketConnection {
    reader: SizeLimitedReader<BufReader<UnixStream>>,
    writer: Arc<ClientWriter>,
}

impl UnixSocketConnection {
    pub fn new(
        stream: UnixStream,
        max_request_bytes: usize,
        write_timeout: Duration,
    ) -> Result<Self, TransportError> {
        // Accepted sockets inherit non-blocking mode from the listener.
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(write_timeout))?;
        let reader_stream = stream.try_clone()?;
        Ok(Self {
            reader: SizeLimitedReader::new(BufReader::new(reader_stream), max_request_bytes),
            writer: Arc::new(ClientWriter::new(stream)),
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.reader.inner.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    /// Next line from the client, or `None` once the peer has closed.
    pub fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.reader.read_line()
    }

    pub fn writer(&self) -> Arc<ClientWriter> {
        Arc::clone(&self.writer)
    }

    pub fn write_line(&self, line: &str) -> Result<(), TransportError> {
        self.writer.write_line(line)
    }
}
