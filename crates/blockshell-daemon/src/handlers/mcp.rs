use serde_json::Value;
use serde_json::json;

use super::HandlerContext;
use super::HandlerResult;
use super::required_str;
use super::success;
use super::to_json;
use crate::error::HandlerError;

fn server_not_found(name: &str) -> HandlerError {
    HandlerError::NotFound(format!("MCP server not found: {}", name))
}

fn string_args(params: &Value) -> Result<Vec<String>, HandlerError> {
    match params.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| HandlerError::InvalidParams("'args' must be strings".to_string()))
            })
            .collect(),
        Some(_) => Err(HandlerError::InvalidParams(
            "'args' must be an array".to_string(),
        )),
    }
}

/// `mcp.connect`: spawn and register a stdio MCP server.
pub fn connect(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let command = required_str(params, "command")?;
    let args = string_args(params)?;

    let tools = ctx.mcp.connect(name, command, args)?;
    Ok(json!({ "name": name, "tools": tools }))
}

pub fn list(ctx: &HandlerContext, _params: &Value) -> HandlerResult {
    to_json(&ctx.mcp.list())
}

pub fn list_tools(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let tools = ctx.mcp.list_tools(name).ok_or_else(|| server_not_found(name))?;
    to_json(&tools)
}

/// `mcp.call_tool`: tool failures come back as a result with `isError` set,
/// not as an RPC error.
pub fn call_tool(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    let tool = required_str(params, "tool")?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let result = ctx
        .mcp
        .call_tool(name, tool, arguments)
        .ok_or_else(|| server_not_found(name))?;
    to_json(&result)
}

pub fn disconnect(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let name = required_str(params, "name")?;
    if !ctx.mcp.disconnect(name) {
        return Err(server_not_found(name));
    }
    success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::TestContext;

    #[test]
    fn test_string_args() {
        assert_eq!(string_args(&json!({})).unwrap(), Vec::<String>::new());
        assert_eq!(
            string_args(&json!({"args": ["-y", "server"]})).unwrap(),
            vec!["-y".to_string(), "server".to_string()]
        );
        assert!(string_args(&json!({"args": [1]})).is_err());
        assert!(string_args(&json!({"args": "x"})).is_err());
    }

    #[test]
    fn test_unknown_server_is_not_found() {
        let t = TestContext::new();
        for result in [
            list_tools(&t.ctx, &json!({"name": "ghost"})),
            call_tool(&t.ctx, &json!({"name": "ghost", "tool": "echo"})),
            disconnect(&t.ctx, &json!({"name": "ghost"})),
        ] {
            assert!(matches!(result.unwrap_err(), HandlerError::NotFound(_)));
        }
        assert_eq!(list(&t.ctx, &json!({})).unwrap(), json!([]));
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let t = TestContext::new();
        let err = connect(
            &t.ctx,
            &json!({"name": "bad", "command": "/nonexistent/mcp-server"}),
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Mcp(_)));
    }
}
