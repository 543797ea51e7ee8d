use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_process_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One spawn of an interactive tool as seen by a UI slot.
///
/// `process_id` is assigned once per spawn and never reused. The only
/// mutation after creation is `is_running` going from true to false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub process_id: String,
    pub tool_name: String,
    pub context_key: String,
    pub started_at: i64,
    pub is_running: bool,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Session {
    pub fn new(process_id: &str, tool_name: &str, context_key: &str, prompt: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            tool_name: tool_name.to_string(),
            context_key: context_key.to_string(),
            started_at: now_ms(),
            is_running: true,
            prompt: prompt.to_string(),
            project_name: None,
            file_path: None,
        }
    }

    pub fn with_project(mut self, project_name: Option<String>) -> Self {
        self.project_name = project_name;
        self
    }

    pub fn with_file(mut self, file_path: Option<String>) -> Self {
        self.file_path = file_path;
        self
    }

    /// Applies a patch. Returns whether anything changed; a finished session
    /// is never flipped back to running.
    pub fn apply(&mut self, patch: &SessionPatch) -> bool {
        match patch.is_running {
            Some(false) if self.is_running => {
                self.is_running = false;
                true
            }
            _ => false,
        }
    }

    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            process_id: self.process_id.clone(),
            tool_name: self.tool_name.clone(),
            context_key: self.context_key.clone(),
            started_at: self.started_at,
            prompt: self.prompt.clone(),
            project_name: self.project_name.clone(),
            file_path: self.file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
}

impl SessionPatch {
    pub fn finished() -> Self {
        Self {
            is_running: Some(false),
        }
    }
}

/// Launch-time snapshot appended to the durable history log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub process_id: String,
    pub tool_name: String,
    pub context_key: String,
    pub started_at: i64,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_only_flips_running_to_finished() {
        let mut session = Session::new("p1", "claude", "ctx", "hi");
        assert!(!session.apply(&SessionPatch { is_running: Some(true) }));
        assert!(session.apply(&SessionPatch::finished()));
        assert!(!session.is_running);
        assert!(!session.apply(&SessionPatch { is_running: Some(true) }));
        assert!(!session.is_running);
    }

    #[test]
    fn session_uses_camel_case_on_the_wire() {
        let session = Session::new("p1", "claude", "docs/plan.md", "hi")
            .with_file(Some("docs/plan.md".to_string()));
        let value = serde_json::to_value(&session).expect("serialize");
        assert_eq!(value["processId"], "p1");
        assert_eq!(value["contextKey"], "docs/plan.md");
        assert_eq!(value["isRunning"], true);
        assert!(value.get("projectName").is_none());

        let history = session.to_history();
        assert_eq!(history.file_path.as_deref(), Some("docs/plan.md"));
        assert_eq!(history.started_at, session.started_at);
    }

    #[test]
    fn process_ids_are_unique() {
        assert_ne!(new_process_id(), new_process_id());
    }
}
