//! RPC method handlers.
//!
//! Each handler is a plain function from request params to a JSON result.
//! [`register_all`] binds them to method names on an [`RpcServer`].

pub mod block;
pub mod fs;
pub mod mcp;
pub mod session;

use std::sync::Arc;

use blockshell_terminal::Executor;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::error::HandlerError;
use crate::mcp_registry::McpRegistry;
use crate::pool::JobRunner;
use crate::rpc::RpcServer;
use crate::store::BlockStore;

pub type HandlerResult = Result<Value, HandlerError>;

/// Session used when a request names none.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Everything handlers operate on, built once by the daemon.
pub struct HandlerContext {
    pub store: Arc<BlockStore>,
    pub executor: Executor,
    pub jobs: JobRunner,
    pub mcp: Arc<McpRegistry>,
}

type Handler = fn(&HandlerContext, &Value) -> HandlerResult;

const METHODS: &[(&str, Handler)] = &[
    ("ping", ping),
    ("block.create", block::create),
    ("block.execute", block::execute),
    ("block.get", block::get),
    ("block.list", block::list),
    ("block.append_output", block::append_output),
    ("block.complete", block::complete),
    ("session.create", session::create),
    ("session.list", session::list),
    ("session.delete", session::delete),
    ("session.rename", session::rename),
    ("session.get_config", session::get_config),
    ("session.set_config", session::set_config),
    ("fs.list", fs::list),
    ("fs.read", fs::read),
    ("fs.write", fs::write),
    ("mcp.connect", mcp::connect),
    ("mcp.list", mcp::list),
    ("mcp.list_tools", mcp::list_tools),
    ("mcp.call_tool", mcp::call_tool),
    ("mcp.disconnect", mcp::disconnect),
];

pub fn register_all(server: &RpcServer, ctx: &Arc<HandlerContext>) {
    for (name, handler) in METHODS {
        let ctx = Arc::clone(ctx);
        let handler = *handler;
        server.register_method(name, move |params| handler(&ctx, params));
    }
}

pub fn method_names() -> impl Iterator<Item = &'static str> {
    METHODS.iter().map(|(name, _)| *name)
}

fn ping(_ctx: &HandlerContext, _params: &Value) -> HandlerResult {
    Ok(json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") }))
}

/// A string param that must be present and non-empty.
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::missing_param(key))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| HandlerError::Failed(e.to_string()))
}

pub(crate) fn success() -> HandlerResult {
    Ok(json!({ "success": true }))
}


#[cfg(test)]
mod tests {
    use super::test_support::TestContext;
    use super::*;

    #[test]
    fn test_register_all_binds_every_method() {
        let t = TestContext::new();
        let server = RpcServer::default();
        register_all(&server, &Arc::new(HandlerContext {
            store: Arc::clone(&t.ctx.store),
            executor: t.ctx.executor,
            jobs: t.ctx.jobs.clone(),
            mcp: Arc::clone(&t.ctx.mcp),
        }));
        for name in method_names() {
            assert!(server.has_method(name), "{} not registered", name);
        }
    }

    #[test]
    fn test_ping() {
        let t = TestContext::new();
        let result = ping(&t.ctx, &json!({})).unwrap();
        assert_eq!(result["pong"], true);
        assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_required_str() {
        let params = json!({"a": "x", "empty": "", "num": 3});
        assert_eq!(required_str(&params, "a").unwrap(), "x");
        for key in ["empty", "num", "missing"] {
            let err = required_str(&params, key).unwrap_err();
            assert!(matches!(err, HandlerError::InvalidParams(_)));
        }
    }
}
