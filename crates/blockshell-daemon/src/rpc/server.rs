//! JSON-RPC 2.0 dispatch over newline-delimited unix-socket connections.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use blockshell_common::error_codes;
use blockshell_common::mutex_lock_or_recover;
use blockshell_common::rwlock_read_or_recover;
use blockshell_common::rwlock_write_or_recover;
use blockshell_ipc::JSONRPC_VERSION;
use blockshell_ipc::RpcNotification;
use blockshell_ipc::RpcRequest;
use blockshell_ipc::RpcResponse;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::transport::ClientWriter;
use super::transport::TransportError;
use super::transport::UnixSocketConnection;
use crate::config::DaemonConfig;
use crate::error::HandlerError;

pub type MethodHandler = Arc<dyn Fn(&Value) -> Result<Value, HandlerError> + Send + Sync>;

const ENCODE_FAILURE: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Failed to encode response"},"id":null}"#;

/// Per-connection socket settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_request_bytes: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: 1024 * 1024,
            write_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

impl From<&DaemonConfig> for ConnectionLimits {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            max_request_bytes: config.max_request_bytes,
            write_timeout: config.client_write_timeout,
            idle_timeout: config.read_timeout(),
        }
    }
}

pub struct RpcServer {
    methods: RwLock<HashMap<String, MethodHandler>>,
    clients: Mutex<HashMap<u64, Arc<ClientWriter>>>,
    next_client_id: AtomicU64,
    active_connections: AtomicUsize,
    in_flight: AtomicUsize,
    limits: ConnectionLimits,
}

fn encode(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        error!(error = %e, "Failed to encode response");
        ENCODE_FAILURE.to_string()
    })
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}

impl RpcServer {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            limits,
        }
    }

    /// Register `handler` for `name`. A later registration for the same name
    /// replaces the earlier one.
    pub fn register_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let previous =
            rwlock_write_or_recover(&self.methods).insert(name.to_string(), Arc::new(handler));
        if previous.is_some() {
            debug!(method = name, "Replaced RPC method");
        }
    }

    pub fn has_method(&self, name: &str) -> bool {
        rwlock_read_or_recover(&self.methods).contains_key(name)
    }

    pub fn client_count(&self) -> usize {
        mutex_lock_or_recover(&self.clients).len()
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Requests currently inside a handler.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Process one request line. Returns the response line, or `None` for
    /// blank input and for successful requests without an id. Failures are
    /// always answered, with a null id when the request had none.
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return Some(encode(&RpcResponse::error(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    &format!("Parse error: {}", e),
                )));
            }
        };

        if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(encode(&RpcResponse::error(
                Value::Null,
                error_codes::INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"",
            )));
        }

        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(encode(&RpcResponse::error(
                    Value::Null,
                    error_codes::INVALID_REQUEST,
                    &format!("Invalid Request: {}", e),
                )));
            }
        };

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let response = self.dispatch(&request);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if request.wants_response() || response.is_error() {
            Some(encode(&response))
        } else {
            None
        }
    }

    pub fn dispatch(&self, request: &RpcRequest) -> RpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);
        let handler = rwlock_read_or_recover(&self.methods)
            .get(&request.method)
            .cloned();
        let Some(handler) = handler else {
            debug!(method = %request.method, "Unknown method");
            return RpcResponse::error(id, error_codes::METHOD_NOT_FOUND, "Method not found");
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&request.params))) {
            Ok(Ok(result)) => RpcResponse::success(id, result),
            Ok(Err(e)) => {
                debug!(
                    method = %request.method,
                    category = %e.category(),
                    error = %e,
                    "Handler returned error"
                );
                RpcResponse::error(id, e.code(), &e.to_string())
            }
            Err(_) => {
                error!(method = %request.method, "Handler panicked");
                RpcResponse::error(id, error_codes::INTERNAL_ERROR, "Internal error")
            }
        }
    }

    /// Push a notification to every connected client. A client whose write
    /// fails or times out is dropped; the others still receive the message.
    pub fn broadcast(&self, method: &str, params: Value) {
        let line = match serde_json::to_string(&RpcNotification::new(method, params)) {
            Ok(l) => l,
            Err(e) => {
                warn!(method, error = %e, "Failed to encode notification");
                return;
            }
        };

        let targets: Vec<(u64, Arc<ClientWriter>)> = mutex_lock_or_recover(&self.clients)
            .iter()
            .map(|(id, w)| (*id, Arc::clone(w)))
            .collect();

        for (client_id, writer) in targets {
            if let Err(e) = writer.write_line(&line) {
                debug!(client_id, method, error = %e, "Dropping client after failed broadcast");
                self.drop_client(client_id);
            }
        }
    }

    fn register_client(&self, writer: Arc<ClientWriter>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock_or_recover(&self.clients).insert(id, writer);
        id
    }

    fn drop_client(&self, client_id: u64) {
        let removed = mutex_lock_or_recover(&self.clients).remove(&client_id);
        if let Some(writer) = removed {
            writer.shutdown();
        }
    }

    /// Close every client socket, waking connection threads blocked in reads.
    pub fn disconnect_all(&self) {
        let clients: Vec<Arc<ClientWriter>> = mutex_lock_or_recover(&self.clients)
            .drain()
            .map(|(_, w)| w)
            .collect();
        for writer in clients {
            writer.shutdown();
        }
    }

    /// Serve one client until it disconnects, idles out, or sends an
    /// oversized request.
    pub fn serve_connection(&self, stream: UnixStream) {
        let mut conn = match UnixSocketConnection::new(
            stream,
            self.limits.max_request_bytes,
            self.limits.write_timeout,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to set up client connection");
                return;
            }
        };
        if let Err(e) = conn.set_read_timeout(self.limits.idle_timeout) {
            error!(error = %e, "Failed to set read timeout");
            return;
        }

        let client_id = self.register_client(conn.writer());
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        debug!(client_id, "Client connected");

        loop {
            let line = match conn.read_line() {
                Ok(Some(line)) => line,
                Ok(None) | Err(TransportError::ConnectionClosed) => break,
                Err(TransportError::Timeout) => {
                    debug!(client_id, "Client idle timeout");
                    break;
                }
                Err(TransportError::SizeLimit { max_bytes }) => {
                    warn!(client_id, max_bytes, "Request too large, closing connection");
                    let response = RpcResponse::error(
                        Value::Null,
                        error_codes::PARSE_ERROR,
                        &format!(
                            "Parse error: request size limit exceeded ({} bytes max)",
                            max_bytes
                        ),
                    );
                    let _ = conn.write_line(&encode(&response));
                    break;
                }
                Err(TransportError::Parse(msg)) => {
                    let response = RpcResponse::error(
                        Value::Null,
                        error_codes::PARSE_ERROR,
                        &format!("Parse error: {}", msg),
                    );
                    if conn.write_line(&encode(&response)).is_err() {
                        break;
                    }
                    continue;
                }
                Err(TransportError::Io(e)) => {
                    error!(client_id, error = %e, "Client connection error");
                    break;
                }
            };

            if let Some(response) = self.handle_line(&line) {
                if let Err(e) = conn.write_line(&response) {
                    debug!(client_id, error = %e, "Client write error");
                    break;
                }
            }
        }

        self.drop_client(client_id);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        debug!(client_id, "Client disconnected");
    }
}
