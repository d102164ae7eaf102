use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

pub const JSONRPC_VERSION: &str = "2.0";

fn empty_params() -> Value {
    json!({})
}

/// A request as it arrives on the daemon socket.
///
/// `jsonrpc` is optional here so that a missing version can be reported as an
/// invalid request rather than a parse error. A missing or null `id` means the
/// caller does not want a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc.as_deref() == Some(JSONRPC_VERSION)
    }

    /// True when the request carries an id that expects a response line.
    pub fn wants_response(&self) -> bool {
        !matches!(self.id, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcServerError>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcServerError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcServerError {
                code,
                message: message.to_string(),
            }),
            id,
        }
    }

    pub fn action_success(id: Value) -> Self {
        Self::success(id, json!({ "success": true }))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A server-initiated message with no id, pushed to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Anything a client may read from the daemon socket.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl ServerMessage {
    /// Classify a line by the presence of `method`: notifications have one,
    /// responses never do.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("method").is_some() {
            Ok(ServerMessage::Notification(serde_json::from_value(value)?))
        } else {
            Ok(ServerMessage::Response(serde_json::from_value(value)?))
        }
    }
}
