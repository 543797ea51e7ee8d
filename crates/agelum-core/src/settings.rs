use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SETTINGS_DIR: &str = ".agelum";
pub const SETTINGS_FILE: &str = "settings.json";

/// Partial per-workflow replacement for a tool's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_permissions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_parameters: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_parameters: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflow_overrides: BTreeMap<String, WorkflowOverride>,
}

impl ToolSettings {
    pub fn workflow(&self, workflow_id: Option<&str>) -> Option<&WorkflowOverride> {
        workflow_id.and_then(|id| self.workflow_overrides.get(id))
    }
}

pub type AgentToolSettings = BTreeMap<String, ToolSettings>;

/// On-disk settings document. Keys other than `agentToolSettings` belong to
/// other parts of the UI and are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsFile {
    #[serde(default)]
    pub agent_tool_settings: AgentToolSettings,
}

impl SettingsFile {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(SETTINGS_DIR).join(SETTINGS_FILE))
    }

    /// Reads the settings file. A missing file yields empty settings; a
    /// malformed one is logged and also yields empty settings.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(
                    event = "settings_read_failed",
                    path = %path.display(),
                    error = %err
                );
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(
                    event = "settings_parse_failed",
                    path = %path.display(),
                    error = %err
                );
                Self::default()
            }
        }
    }

    pub fn tool(&self, tool_name: &str) -> Option<&ToolSettings> {
        self.agent_tool_settings.get(tool_name)
    }
}

/// Treats empty and whitespace-only strings as absent.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.trim().is_empty())
}

/// Tokenizes free-text CLI parameters with shell quoting rules, falling back
/// to whitespace splitting when the quoting is unbalanced.
pub fn split_cli_parameters(text: &str) -> Vec<String> {
    match shell_words::split(text) {
        Ok(tokens) => tokens,
        Err(_) => text.split_whitespace().map(str::to_string).collect(),
    }
}
