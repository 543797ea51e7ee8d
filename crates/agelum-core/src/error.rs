use thiserror::Error;

/// Failure taxonomy shared by the hub and its clients.
///
/// Cancellation is not represented here: a locally aborted stream is a normal
/// terminal state, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool \"{0}\" is not installed or not in PATH")]
    ToolUnavailable(String),
    #[error("Tool \"{0}\" is opened in the browser and cannot be spawned")]
    NotSpawnable(String),
    #[error("Failed to start process: {0}")]
    SpawnFailure(String),
    #[error("Command execution timed out after {minutes} minutes")]
    Timeout { minutes: u64 },
    #[error("model listing unavailable for {tool}: {reason}")]
    ModelListUnavailable { tool: String, reason: String },
    #[error("session {0} is no longer running")]
    ReconnectMiss(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::UnknownTool(_) => "unknown_tool",
            AgentError::ToolUnavailable(_) => "tool_unavailable",
            AgentError::NotSpawnable(_) => "not_spawnable",
            AgentError::SpawnFailure(_) => "spawn_failure",
            AgentError::Timeout { .. } => "timeout",
            AgentError::ModelListUnavailable { .. } => "model_list_unavailable",
            AgentError::ReconnectMiss(_) => "reconnect_miss",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_user_visible_diagnostics() {
        assert_eq!(
            AgentError::ToolUnavailable("codex".to_string()).to_string(),
            "Tool \"codex\" is not installed or not in PATH"
        );
        assert_eq!(
            AgentError::Timeout { minutes: 5 }.to_string(),
            "Command execution timed out after 5 minutes"
        );
        assert_eq!(
            AgentError::SpawnFailure("No such file".to_string()).to_string(),
            "Failed to start process: No such file"
        );
    }
}
