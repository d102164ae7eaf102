use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use blockshell_common::ValueExt;
use blockshell_terminal::DEFAULT_COLS;
use blockshell_terminal::DEFAULT_ROWS;
use blockshell_terminal::StreamOptions;
use blockshell_terminal::TERMINATED_ABNORMALLY;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;

use super::DEFAULT_SESSION_ID;
use super::HandlerContext;
use super::HandlerResult;
use super::required_str;
use super::success;
use super::to_json;
use crate::error::HandlerError;
use crate::execution::execute_to_block;
use crate::pool::JobRejected;

fn block_not_found() -> HandlerError {
    HandlerError::NotFound("Block not found".to_string())
}

/// `block.create`: record a block without running anything. Output and
/// completion are supplied by the client.
pub fn create(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = params.str_or("session_id", DEFAULT_SESSION_ID);
    let command = required_str(params, "command")?;
    let block_id = ctx.store.create_block(session_id, command, params.opt_str("cwd"));
    Ok(json!({ "block_id": block_id }))
}

/// `block.execute`: create a block and run it on a thread of its own. Returns
/// as soon as the block exists; output arrives as notifications.
pub fn execute(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = params.str_or("session_id", DEFAULT_SESSION_ID);
    let command = required_str(params, "command")?;
    let cols = params.i64_or("cols", i64::from(DEFAULT_COLS));
    let rows = params.i64_or("rows", i64::from(DEFAULT_ROWS));

    let before = ctx.store.get_session_config_copy(session_id);
    // The block runs where the session was, not where `cd` is taking it.
    let block_cwd = params.opt_str("cwd").unwrap_or(&before.cwd).to_string();
    if let Some(target) = cd_target(command) {
        match resolve_cd(target, &block_cwd) {
            Some(dir) => {
                info!(session_id, cwd = %dir, "Changing session directory");
                ctx.store.set_session_cwd(session_id, &dir);
            }
            None => warn!(session_id, target, "cd target is not a directory"),
        }
    }

    let block_id = ctx.store.create_block(session_id, command, Some(block_cwd.as_str()));
    let after = ctx.store.get_session_config_copy(session_id);

    let options = StreamOptions::default()
        .with_cwd(block_cwd)
        .with_shell(after.shell.clone())
        .with_size(cols, rows);
    let store = Arc::clone(&ctx.store);
    let executor = ctx.executor;
    let job_block_id = block_id.clone();
    let job_command = command.to_string();
    let job = Box::new(move || {
        execute_to_block(&store, &executor, &job_block_id, &job_command, &options);
    });

    if let Err(e) = ctx.jobs.spawn(job) {
        warn!(block_id = %block_id, error = %e, "Rejecting command");
        ctx.store
            .append_output(&block_id, b"blockshell: too many commands running\r\n", "stderr");
        ctx.store.complete_block(&block_id, TERMINATED_ABNORMALLY);
        return Err(match e {
            JobRejected::AtCapacity { .. } => {
                HandlerError::Failed("Too many commands running, try again later".to_string())
            }
            JobRejected::Spawn(e) => HandlerError::Failed(format!("Failed to start command: {}", e)),
        });
    }

    Ok(json!({
        "block_id": block_id,
        "session_config": { "cwd": after.cwd, "shell": after.shell },
    }))
}

pub fn get(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let block_id = required_str(params, "block_id")?;
    let block = ctx.store.get_block(block_id).ok_or_else(block_not_found)?;
    to_json(&block)
}

pub fn list(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let session_id = params.str_or("session_id", DEFAULT_SESSION_ID);
    to_json(&ctx.store.list_blocks(session_id))
}

/// `block.append_output`: output for a client-driven block.
pub fn append_output(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let block_id = required_str(params, "block_id")?;
    let data = params
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::missing_param("data"))?;
    let kind = params.str_or("type", "stdout");

    if ctx.store.append_output(block_id, data.as_bytes(), kind) {
        return success();
    }
    match ctx.store.get_block(block_id) {
        Some(_) => Err(HandlerError::Failed("Block already complete".to_string())),
        None => Err(block_not_found()),
    }
}

/// `block.complete`: finish a client-driven block. Completing a block twice
/// is not an error; the second call reports `success: false`.
pub fn complete(ctx: &HandlerContext, params: &Value) -> HandlerResult {
    let block_id = required_str(params, "block_id")?;
    let exit_code = params.i64_or("exit_code", 0);
    let exit_code = i32::try_from(exit_code)
        .map_err(|_| HandlerError::InvalidParams(format!("exit_code out of range: {}", exit_code)))?;

    if ctx.store.get_block(block_id).is_none() {
        return Err(block_not_found());
    }
    let completed = ctx.store.complete_block(block_id, exit_code);
    Ok(json!({ "success": completed }))
}

/// The target of a `cd` command, if `command` is one. Empty for a bare `cd`.
fn cd_target(command: &str) -> Option<&str> {
    let command = command.trim();
    if command == "cd" {
        return Some("");
    }
    command.strip_prefix("cd ").map(str::trim)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolve a `cd` target against `cwd`. Returns the canonical directory, or
/// `None` when the target does not name an existing directory.
fn resolve_cd(target: &str, cwd: &str) -> Option<String> {
    let path = if target.is_empty() || target == "~" {
        home_dir()
    } else if let Some(rest) = target.strip_prefix("~/") {
        home_dir().join(rest)
    } else if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        Path::new(cwd).join(target)
    };

    let canonical = std::fs::canonicalize(&path).ok()?;
    canonical
        .is_dir()
        .then(|| canonical.to_string_lossy().into_owned())
}
