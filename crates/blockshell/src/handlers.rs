use std::io::Write;
use std::time::Duration;

use blockshell_common::ValueExt;
use blockshell_ipc::ClientError;
use blockshell_ipc::DaemonClient;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::commands::OutputFormat;
use crate::text::strip_ansi_codes;

pub type HandlerResult = Result<(), Box<dyn std::error::Error>>;

const NOTIFICATION_POLL: Duration = Duration::from_millis(500);

const STATE_LABELS: [&str; 4] = ["running", "completed", "failed", "cancelled"];

pub struct HandlerContext<'a> {
    pub client: &'a mut DaemonClient,
    pub format: OutputFormat,
}

impl<'a> HandlerContext<'a> {
    pub fn new(client: &'a mut DaemonClient, format: OutputFormat) -> Self {
        Self { client, format }
    }

    fn output_json_or<F>(&self, result: &Value, text_fn: F) -> HandlerResult
    where
        F: FnOnce(),
    {
        match self.format {
            OutputFormat::Json => print_json(result)?,
            OutputFormat::Text => text_fn(),
        }
        Ok(())
    }
}

fn print_json(value: &Value) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_label(state: i64) -> &'static str {
    usize::try_from(state)
        .ok()
        .and_then(|i| STATE_LABELS.get(i).copied())
        .unwrap_or("unknown")
}

/// Parse the `call` parameter argument; absent means an empty object.
pub fn parse_params(raw: Option<&str>) -> Result<Value, ClientError> {
    match raw {
        None => Ok(json!({})),
        Some(text) => {
            let value: Value = serde_json::from_str(text)?;
            if value.is_object() || value.is_array() {
                Ok(value)
            } else {
                Err(ClientError::RpcError {
                    code: blockshell_ipc::error_codes::INVALID_PARAMS,
                    message: "params must be a JSON object or array".to_string(),
                })
            }
        }
    }
}

/// Output collected for one block while it runs.
#[derive(Debug, Default)]
struct BlockRun {
    output: String,
    exit_code: Option<i64>,
    duration_ms: i64,
}

pub fn handle_exec(
    ctx: &mut HandlerContext,
    command: String,
    session: String,
    cwd: Option<String>,
    cols: u16,
    rows: u16,
    plain: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut params = json!({
        "session_id": session,
        "command": command,
        "cols": cols,
        "rows": rows,
    });
    if let Some(dir) = cwd {
        params["cwd"] = json!(dir);
    }

    let result = ctx.client.call("block.execute", Some(params))?;
    let block_id = result.str_or("block_id", "").to_string();
    if block_id.is_empty() {
        return Err(Box::new(ClientError::InvalidResponse));
    }
    debug!(block_id = %block_id, "Streaming block output");

    let stream_text = ctx.format == OutputFormat::Text;
    let mut run = BlockRun::default();
    let mut stdout = std::io::stdout();

    while run.exit_code.is_none() {
        let Some(note) = ctx.client.next_notification(NOTIFICATION_POLL)? else {
            continue;
        };
        if note.params.str_or("block_id", "") != block_id {
            continue;
        }
        match note.method.as_str() {
            "block.output" => {
                let data = note.params.str_or("data", "");
                let data = if plain {
                    strip_ansi_codes(data)
                } else {
                    data.to_string()
                };
                if stream_text {
                    stdout.write_all(data.as_bytes())?;
                    stdout.flush()?;
                } else {
                    run.output.push_str(&data);
                }
            }
            "block.complete" => {
                run.exit_code = Some(note.params.i64_or("exit_code", -1));
                run.duration_ms = note.params.i64_or("duration_ms", 0);
            }
            _ => {}
        }
    }

    let exit_code = run.exit_code.unwrap_or(-1);
    if !stream_text {
        print_json(&json!({
            "block_id": block_id,
            "exit_code": exit_code,
            "duration_ms": run.duration_ms,
            "output": run.output,
        }))?;
    }

    Ok(i32::try_from(exit_code).unwrap_or(-1))
}

pub fn handle_sessions(ctx: &mut HandlerContext) -> HandlerResult {
    let result = ctx.client.call("session.list", None)?;

    ctx.output_json_or(&result, || {
        let sessions = result.as_array().map(Vec::as_slice).unwrap_or(&[]);
        if sessions.is_empty() {
            println!("No sessions");
            return;
        }
        for session in sessions {
            println!(
                "{}\t{}",
                session.str_or("id", "?"),
                session.str_or("name", "")
            );
        }
    })
}

pub fn handle_blocks(ctx: &mut HandlerContext, session: String) -> HandlerResult {
    let result = ctx
        .client
        .call("block.list", Some(json!({ "session_id": session })))?;

    ctx.output_json_or(&result, || {
        let blocks = result.as_array().map(Vec::as_slice).unwrap_or(&[]);
        if blocks.is_empty() {
            println!("No blocks in session {}", session);
            return;
        }
        for block in blocks {
            let exit = block
                .get("exit_code")
                .and_then(Value::as_i64)
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}\t{:<9}\t{:>4}\t{}",
                block.str_or("id", "?"),
                state_label(block.i64_or("state", -1)),
                exit,
                block.str_or("command", "")
            );
        }
    })
}

pub fn handle_call(
    ctx: &mut HandlerContext,
    method: String,
    params: Option<String>,
) -> HandlerResult {
    let params = parse_params(params.as_deref())?;
    let result = ctx.client.call(&method, Some(params))?;
    print_json(&result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_defaults_to_empty_object() {
        assert_eq!(parse_params(None).unwrap(), json!({}));
    }

    #[test]
    fn test_parse_params_accepts_objects() {
        let value = parse_params(Some(r#"{"session_id":"work"}"#)).unwrap();
        assert_eq!(value["session_id"], "work");
    }

    #[test]
    fn test_parse_params_rejects_scalars_and_garbage() {
        assert!(matches!(
            parse_params(Some("42")),
            Err(ClientError::RpcError { .. })
        ));
        assert!(matches!(
            parse_params(Some("{not json")),
            Err(ClientError::SerializationFailed(_))
        ));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(state_label(0), "running");
        assert_eq!(state_label(1), "completed");
        assert_eq!(state_label(2), "failed");
        assert_eq!(state_label(3), "cancelled");
        assert_eq!(state_label(9), "unknown");
        assert_eq!(state_label(-1), "unknown");
    }
}
