use blockshell_common::ValueExt;
use serde_json::Value;
use serde_json::json;

use super::DEFAULT_SESSION_ID;
use super::HandlerContext;
use super::HandlerResult;
use super::required_str;
use super::success;
use super::to_json;
use crate::error::HandlerError;
use crate::store::DEFAULT_SESSION_NAME;

fn session_not_found(session_id: &str) -> HandlerError {
    HandlerError::NotFound(format!("Session not found: {}", session_id))
}

pub fn create(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let name = params.str_or("name", DEFAULT_SESSION_NAME);
    let session_id = ctx.store.create_session(name);
    Ok(json!({ "session_id": session_id, "name": name }))
}

pub fn list(ctx: &HandlerContext, _params: &Value) -> HandlerResult {
    to_json(&ctx.store.list_sessions())
}

pub fn delete(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = required_str(params, "session_id")?;
    if !ctx.store.delete_session(session_id) {
        return Err(session_not_found(session_id));
    }
    success()
}

pub fn rename(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = required_str(params, "session_id")?;
    let name = required_str(params, "name")?;
    if !ctx.store.rename_session(session_id, name) {
        return Err(session_not_found(session_id));
    }
    success()
}

pub fn get_config(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = params.str_or("session_id", DEFAULT_SESSION_ID);
    to_json(&ctx.store.get_session_config_copy(session_id))
}

/// `session.set_config`: update `cwd` and/or `shell`; absent or empty
/// fields are left alone.
pub fn set_config(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = params.str_or("session_id", DEFAULT_SESSION_ID);
    if let Some(cwd) = params.opt_str("cwd") {
        ctx.store.set_session_cwd(session_id, cwd);
    }
    if let Some(shell) = params.opt_str("shell") {
        ctx.store.set_session_shell(session_id, shell);
    }
    success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::TestContext;

    #[test]
    fn test_create_and_list() {
        let t = TestContext::new();
        let created = create(&t.ctx, &json!({"name": "Work"})).unwrap();
        assert_eq!(created["name"], "Work");
        let id = created["session_id"].as_str().unwrap();

        let listed = list(&t.ctx, &json!({})).unwrap();
        assert_eq!(listed, json!([{"id": id, "name": "Work"}]));
    }

    #[test]
    fn test_create_defaults_name() {
        let t = TestContext::new();
        let created = create(&t.ctx, &json!({})).unwrap();
        assert_eq!(created["name"], DEFAULT_SESSION_NAME);
    }

    #[test]
    fn test_rename_and_delete() {
        let t = TestContext::new();
        let id = create(&t.ctx, &json!({"name": "A"})).unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        assert_eq!(
            rename(&t.ctx, &json!({"session_id": id, "name": "B"})).unwrap(),
            json!({"success": true})
        );
        assert_eq!(list(&t.ctx, &json!({})).unwrap()[0]["name"], "B");

        delete(&t.ctx, &json!({"session_id": id})).unwrap();
        assert_eq!(list(&t.ctx, &json!({})).unwrap(), json!([]));
        assert!(matches!(
            delete(&t.ctx, &json!({"session_id": id})).unwrap_err(),
            HandlerError::NotFound(_)
        ));
        assert!(matches!(
            rename(&t.ctx, &json!({"session_id": "s"})).unwrap_err(),
            HandlerError::InvalidParams(_)
        ));
    }

    #[test]
    fn test_get_and_set_config() {
        let t = TestContext::new();
        set_config(&t.ctx, &json!({"session_id": "s", "cwd": "/srv", "shell": ""})).unwrap();
        let config = get_config(&t.ctx, &json!({"session_id": "s"})).unwrap();
        assert_eq!(config, json!({"cwd": "/srv", "shell": "/bin/bash"}));

        set_config(&t.ctx, &json!({"session_id": "s", "shell": "/bin/zsh"})).unwrap();
        let config = get_config(&t.ctx, &json!({"session_id": "s"})).unwrap();
        assert_eq!(config, json!({"cwd": "/srv", "shell": "/bin/zsh"}));
    }
}
