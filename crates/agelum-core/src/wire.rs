//! JSON payloads and header names exchanged between the hub and its clients.

use crate::session::HistoryEntry;
use serde::{Deserialize, Serialize};

pub const PROCESS_ID_HEADER: &str = "x-agent-process-id";
pub const PROCESS_RUNNING_HEADER: &str = "x-agent-process-running";
pub const STREAM_KIND_HEADER: &str = "x-agent-stream";

pub const DEFAULT_COLS: u16 = 200;
pub const DEFAULT_ROWS: u16 = 50;

/// Distinguishes a fresh launch body from a reattach body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Launch,
    Resume,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Launch => "launch",
            StreamKind::Resume => "resume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "launch" => Some(StreamKind::Launch),
            "resume" => Some(StreamKind::Resume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub tool: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_modify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    #[serde(flatten)]
    pub run: RunRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl LaunchRequest {
    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            self.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRequest {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub tool_name: String,
    pub started_at: i64,
    pub transcript_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolAvailability {
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub available: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolsResponse {
    pub tools: Vec<ToolAvailability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

/// History append body. Identity fields may be omitted and are filled by the
/// hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAppend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub context_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl From<&HistoryEntry> for HistoryAppend {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            process_id: Some(entry.process_id.clone()),
            tool_name: entry.tool_name.clone(),
            context_key: entry.context_key.clone(),
            started_at: Some(entry.started_at),
            prompt: entry.prompt.clone(),
            project_name: entry.project_name.clone(),
            file_path: entry.file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryAppendResponse {
    pub session: HistoryEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MtimeResponse {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_request_flattens_run_fields() {
        let request: LaunchRequest = serde_json::from_str(
            r#"{"tool":"claude","prompt":"hi","allowModify":true,"cols":120}"#,
        )
        .expect("parse");
        assert_eq!(request.run.tool, "claude");
        assert_eq!(request.run.allow_modify, Some(true));
        assert_eq!(request.size(), (120, DEFAULT_ROWS));
    }

    #[test]
    fn status_omits_exit_code_while_alive() {
        let status = SessionStatus {
            alive: true,
            exit_code: None,
            tool_name: "codex".to_string(),
            started_at: 1,
            transcript_bytes: 42,
        };
        let value = serde_json::to_value(&status).expect("serialize");
        assert!(value.get("exitCode").is_none());
        assert_eq!(value["transcriptBytes"], 42);
    }

    #[test]
    fn stream_kind_parses_header_values() {
        assert_eq!(StreamKind::parse("resume"), Some(StreamKind::Resume));
        assert_eq!(StreamKind::parse(StreamKind::Launch.as_str()), Some(StreamKind::Launch));
        assert_eq!(StreamKind::parse("other"), None);
    }
}
