use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_SESSION_NAME: &str = "New Session";

/// Lifecycle of a block. Serialized as its ordinal so snapshots stay
/// readable by existing front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BlockState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BlockState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BlockState::Running)
    }

    pub fn for_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            BlockState::Completed
        } else {
            BlockState::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockState::Running => "running",
            BlockState::Completed => "completed",
            BlockState::Failed => "failed",
            BlockState::Cancelled => "cancelled",
        }
    }
}

impl From<BlockState> for u8 {
    fn from(state: BlockState) -> u8 {
        match state {
            BlockState::Running => 0,
            BlockState::Completed => 1,
            BlockState::Failed => 2,
            BlockState::Cancelled => 3,
        }
    }
}

impl TryFrom<u8> for BlockState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlockState::Running),
            1 => Ok(BlockState::Completed),
            2 => Ok(BlockState::Failed),
            3 => Ok(BlockState::Cancelled),
            other => Err(format!("unknown block state {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub data: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: i32,
    pub state: BlockState,
    #[serde(default)]
    pub output_chunks: Vec<OutputChunk>,
    #[serde(default)]
    pub metadata: Value,
}

impl Block {
    pub fn duration_ms(&self) -> i64 {
        if self.end_time == 0 {
            0
        } else {
            (self.end_time - self.start_time).max(0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    pub cwd: String,
    pub shell: String,
}

/// A point-in-time copy of a session's execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    pub cwd: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
}

/// Everything observers need about a finished block, captured before the
/// store lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCompletion {
    pub block_id: String,
    pub session_id: String,
    pub exit_code: i32,
    pub state: BlockState,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_serializes_as_ordinal() {
        assert_eq!(serde_json::to_value(BlockState::Failed).unwrap(), json!(2));
        let state: BlockState = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(state, BlockState::Cancelled);
        assert!(serde_json::from_value::<BlockState>(json!(9)).is_err());
    }

    #[test]
    fn test_state_for_exit_code() {
        assert_eq!(BlockState::for_exit_code(0), BlockState::Completed);
        assert_eq!(BlockState::for_exit_code(1), BlockState::Failed);
        assert_eq!(BlockState::for_exit_code(-1), BlockState::Failed);
        assert!(!BlockState::Running.is_terminal());
        assert!(BlockState::Cancelled.is_terminal());
    }

    #[test]
    fn test_chunk_wire_names() {
        let chunk = OutputChunk {
            data: "hi".into(),
            kind: "stdout".into(),
            timestamp_ms: 5,
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"data": "hi", "type": "stdout", "ts": 5})
        );
    }

    #[test]
    fn test_block_optional_fields_default() {
        let block: Block = serde_json::from_value(json!({
            "id": "b", "session_id": "s", "command": "ls", "cwd": "/",
            "start_time": 10, "end_time": 25, "exit_code": 0, "state": 1
        }))
        .unwrap();
        assert!(block.env.is_empty());
        assert!(block.output_chunks.is_empty());
        assert_eq!(block.metadata, Value::Null);
        assert_eq!(block.duration_ms(), 15);
    }

    #[test]
    fn test_block_missing_required_field_is_rejected() {
        let result = serde_json::from_value::<Block>(json!({"id": "b", "session_id": "s"}));
        assert!(result.is_err());
    }
}
