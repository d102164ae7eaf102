use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use blockshell_common::mutex_lock_or_recover;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::McpError;
use crate::transport::Transport;
use crate::types::Tool;
use crate::types::ToolResult;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Calls awaiting a response, keyed by request id. Each slot is filled at most
/// once; whoever removes the entry first (the reader or the timed-out caller)
/// owns it.
#[derive(Default)]
struct PendingTable {
    slots: Mutex<HashMap<u64, Sender<Value>>>,
}

impl PendingTable {
    fn insert(&self, id: u64, slot: Sender<Value>) {
        mutex_lock_or_recover(&self.slots).insert(id, slot);
    }

    fn remove(&self, id: u64) -> Option<Sender<Value>> {
        mutex_lock_or_recover(&self.slots).remove(&id)
    }

    fn len(&self) -> usize {
        mutex_lock_or_recover(&self.slots).len()
    }

    /// Route an inbound line to its waiting caller, if any.
    fn dispatch(&self, line: &str) {
        let message: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable message from MCP server");
                return;
            }
        };

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            debug!(method = ?message.get("method"), "ignoring message without numeric id");
            return;
        };

        match self.remove(id) {
            Some(slot) => {
                let _ = slot.send(message);
            }
            None => debug!(id, "ignoring response for unknown request"),
        }
    }
}

/// A JSON-RPC client for one MCP server.
pub struct Client {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    call_timeout: Duration,
    client_name: String,
    client_version: String,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let pending = Arc::new(PendingTable::default());
        let table = Arc::clone(&pending);
        transport.set_message_handler(Arc::new(move |line: &str| table.dispatch(line)));

        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            call_timeout: CALL_TIMEOUT,
            client_name: "blockshell".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_client_info(mut self, name: &str, version: &str) -> Self {
        self.client_name = name.to_string();
        self.client_version = version.to_string();
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start the transport and perform the `initialize` handshake, followed
    /// by the `notifications/initialized` notification.
    pub fn initialize(&self) -> Result<(), McpError> {
        self.transport.start()?;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version,
            }
        });
        let result = self.call("initialize", params)?;
        debug!(server_info = ?result.get("serverInfo"), "MCP initialize complete");

        self.notify("notifications/initialized", json!({}))?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Tools offered by the server; empty on any failure.
    pub fn list_tools(&self) -> Vec<Tool> {
        match self.try_list_tools() {
            Ok(tools) => tools,
            Err(e) => {
                error!(error = %e, "tools/list failed");
                Vec::new()
            }
        }
    }

    pub fn try_list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_initialized()?;
        let result = self.call("tools/list", json!({}))?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(tools)?)
    }

    /// Invoke a tool. Failures are reported inside the result, never as an
    /// error.
    pub fn call_tool(&self, name: &str, arguments: Value) -> ToolResult {
        let outcome = self.ensure_initialized().and_then(|_| {
            let result = self.call("tools/call", json!({ "name": name, "arguments": arguments }))?;
            Ok(serde_json::from_value::<ToolResult>(result)?)
        });

        match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(tool = name, error = %e, "tools/call failed");
                ToolResult::error(&e.to_string())
            }
        }
    }

    /// Closes the underlying transport. Outstanding calls run into their
    /// timeout.
    pub fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.transport.close();
    }

    /// Send a request and block until its response arrives or the call times
    /// out. Returns the `result` member, or `{}` if the server sent none.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (slot, response) = crossbeam_channel::bounded(1);
        self.pending.insert(id, slot);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.transport.send(&request.to_string()) {
            self.pending.remove(id);
            return Err(McpError::Transport(format!(
                "Failed to send request: {}",
                e
            )));
        }

        let message = match response.recv_timeout(self.call_timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.pending.remove(id);
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout: self.call_timeout,
                });
            }
        };

        if let Some(error) = message.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            return Err(McpError::Rpc { code, message });
        }

        Ok(message.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.transport.send(&notification.to_string())
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageHandler;
    use std::sync::RwLock;
    use std::thread;

    type Responder = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

    /// Answers requests in-process on a separate thread.
    struct MockTransport {
        handler: RwLock<Option<MessageHandler>>,
        sent: Mutex<Vec<Value>>,
        responder: Responder,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn new(responder: Responder) -> Arc<Self> {
            Arc::new(Self {
                handler: RwLock::new(None),
                sent: Mutex::new(Vec::new()),
                responder,
                fail_sends: AtomicBool::new(false),
            })
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
                .collect()
        }

        fn deliver(&self, line: &str) {
            let handler = self.handler.read().unwrap().clone().unwrap();
            handler(line);
        }
    }

    impl Transport for MockTransport {
        fn start(&self) -> Result<(), McpError> {
            Ok(())
        }

        fn close(&self) {}

        fn send(&self, message: &str) -> Result<(), McpError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(McpError::Transport("pipe closed".into()));
            }
            let value: Value = serde_json::from_str(message).unwrap();
            self.sent.lock().unwrap().push(value.clone());
            if let Some(reply) = (self.responder)(&value) {
                let handler = self.handler.read().unwrap().clone().unwrap();
                thread::spawn(move || handler(&reply.to_string()));
            }
            Ok(())
        }

        fn set_message_handler(&self, handler: MessageHandler) {
            *self.handler.write().unwrap() = Some(handler);
        }
    }

    fn echo_server() -> Responder {
        Box::new(|req: &Value| {
            let id = req.get("id")?.clone();
            let result = match req["method"].as_str()? {
                "initialize" => json!({"protocolVersion": PROTOCOL_VERSION}),
                "tools/list" => json!({"tools": [
                    {"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}
                ]}),
                "tools/call" => {
                    let text = req["params"]["arguments"]["text"].as_str().unwrap_or("");
                    json!({"content": [{"type": "text", "text": format!("Echo: {}", text)}]})
                }
                "empty" => return Some(json!({"jsonrpc": "2.0", "id": id})),
                "silent" => return None,
                _ => {
                    return Some(json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32601, "message": "Method not found"}
                    }));
                }
            };
            Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
        })
    }

    #[test]
    fn test_initialize_sends_handshake_then_notification() {
        let transport = MockTransport::new(echo_server());
        let client = Client::new(transport.clone());

        client.initialize().unwrap();

        assert!(client.is_initialized());
        assert_eq!(
            transport.sent_methods(),
            vec!["initialize", "notifications/initialized"]
        );
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0]["params"]["protocolVersion"], "0.1.0");
        assert_eq!(sent[0]["params"]["clientInfo"]["name"], "blockshell");
        assert!(sent[1].get("id").is_none());
    }

    #[test]
    fn test_ids_increase_monotonically() {
        let transport = MockTransport::new(echo_server());
        let client = Client::new(transport.clone());
        client.call("tools/list", json!({})).unwrap();
        client.call("tools/list", json!({})).unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0]["id"], 1);
        assert_eq!(sent[1]["id"], 2);
    }

    #[test]
    fn test_list_tools_and_call_tool() {
        let client = Client::new(MockTransport::new(echo_server()));
        client.initialize().unwrap();

        let tools = client.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = client.call_tool("echo", json!({"text": "hi"}));
        assert!(!result.is_error);
        assert_eq!(result.text(), "Echo: hi");
    }

    #[test]
    fn test_tool_calls_require_initialize() {
        let client = Client::new(MockTransport::new(echo_server()));
        assert!(client.list_tools().is_empty());

        let result = client.call_tool("echo", json!({"text": "hi"}));
        assert!(result.is_error);
        assert_eq!(result.text(), "Client not initialized");
    }

    #[test]
    fn test_error_response_becomes_rpc_error() {
        let client = Client::new(MockTransport::new(echo_server()));
        let err = client.call("missing", json!({})).unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, ref message } if message == "Method not found"));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_missing_result_yields_empty_object() {
        let client = Client::new(MockTransport::new(echo_server()));
        assert_eq!(client.call("empty", json!({})).unwrap(), json!({}));
    }

    #[test]
    fn test_timeout_removes_pending_entry() {
        let client = Client::new(MockTransport::new(echo_server()))
            .with_call_timeout(Duration::from_millis(100));

        let err = client.call("silent", json!({})).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_late_response_after_timeout_is_ignored() {
        let transport = MockTransport::new(echo_server());
        let client =
            Client::new(transport.clone()).with_call_timeout(Duration::from_millis(50));

        assert!(client.call("silent", json!({})).is_err());
        transport.deliver(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_send_failure_removes_pending_entry() {
        let transport = MockTransport::new(echo_server());
        transport.fail_sends.store(true, Ordering::SeqCst);
        let client = Client::new(transport);

        let err = client.call("tools/list", json!({})).unwrap_err();
        assert!(err.to_string().contains("Failed to send request"));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_and_malformed_lines_are_ignored() {
        let transport = MockTransport::new(echo_server());
        let client = Client::new(transport.clone());
        transport.deliver("not json");
        transport.deliver(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        transport.deliver(r#"{"jsonrpc":"2.0","id":99,"result":{}}"#);
        transport.deliver(r#"{"jsonrpc":"2.0","id":"1","result":{}}"#);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_calls_are_correlated_by_id() {
        let client = Arc::new(Client::new(MockTransport::new(echo_server())));
        client.initialize().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    let text = format!("msg-{}", i);
                    let result = client.call_tool("echo", json!({ "text": text }));
                    assert_eq!(result.text(), format!("Echo: msg-{}", i));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_default_timeout_is_ten_seconds() {
        assert_eq!(CALL_TIMEOUT, Duration::from_secs(10));
    }
}
