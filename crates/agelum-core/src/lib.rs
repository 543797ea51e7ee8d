use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod compile;
pub mod error;
pub mod session;
pub mod settings;
pub mod wire;

pub use compile::{compile, CompileRequest, CompiledCommand, ResolvedOptions, PERMISSION_NOTICE};
pub use error::AgentError;
pub use session::{HistoryEntry, Session, SessionPatch};
pub use settings::{AgentToolSettings, SettingsFile, ToolSettings, WorkflowOverride};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolKind {
    Cli,
    App,
    Web { url: String },
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Cli => "cli",
            ToolKind::App => "app",
            ToolKind::Web { .. } => "web",
        }
    }

    /// Web tools are opened by the UI and never run as a local process.
    pub fn is_spawnable(&self) -> bool {
        match self {
            ToolKind::Cli | ToolKind::App => true,
            ToolKind::Web { .. } => false,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "cli" => Ok(ToolKind::Cli),
            "app" => Ok(ToolKind::App),
            "web" => Ok(ToolKind::Web { url: String::new() }),
            other => Err(format!("Unknown tool kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: ToolKind,
    /// Invocable command, possibly several tokens (`codex exec`).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub prompt_flag: Option<String>,
    #[serde(default)]
    pub list_models_command: Option<String>,
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub escalation_flag: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ToolDefinition {
    pub fn cli(name: &str, display_name: &str, command: &str) -> Self {
        Self::with_kind(name, display_name, command, ToolKind::Cli)
    }

    pub fn app(name: &str, display_name: &str, command: &str) -> Self {
        Self::with_kind(name, display_name, command, ToolKind::App)
    }

    pub fn web(name: &str, display_name: &str, url: &str) -> Self {
        Self::with_kind(
            name,
            display_name,
            "",
            ToolKind::Web {
                url: url.to_string(),
            },
        )
    }

    fn with_kind(name: &str, display_name: &str, command: &str, kind: ToolKind) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            kind,
            command: command.to_string(),
            model_flag: None,
            prompt_flag: None,
            list_models_command: None,
            models: None,
            escalation_flag: None,
            extra_args: Vec::new(),
        }
    }

    pub fn model_flag(mut self, flag: &str) -> Self {
        self.model_flag = Some(flag.to_string());
        self
    }

    pub fn prompt_flag(mut self, flag: &str) -> Self {
        self.prompt_flag = Some(flag.to_string());
        self
    }

    pub fn list_models_command(mut self, command: &str) -> Self {
        self.list_models_command = Some(command.to_string());
        self
    }

    pub fn static_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|model| model.to_string()).collect());
        self
    }

    pub fn escalation_flag(mut self, flag: &str) -> Self {
        self.escalation_flag = Some(flag.to_string());
        self
    }

    pub fn extra_args(mut self, args: &[&str]) -> Self {
        self.extra_args = args.iter().map(|arg| arg.to_string()).collect();
        self
    }

    /// The executable token of `command`, if any.
    pub fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }

    pub fn base_args(&self) -> Vec<String> {
        self.command
            .split_whitespace()
            .skip(1)
            .map(|token| token.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ToolDefinition::cli("opencode", "opencode", "opencode")
                .model_flag("--model")
                .prompt_flag("run")
                .list_models_command("opencode models list"),
            ToolDefinition::cli("cursor", "cursor", "cursor-agent")
                .model_flag("--model")
                .prompt_flag("-p")
                .escalation_flag("--force"),
            ToolDefinition::cli("trae", "trae", "trae-cli")
                .model_flag("--model")
                .prompt_flag("run")
                .escalation_flag("--yolo"),
            ToolDefinition::cli("claude", "claude code", "claude")
                .model_flag("--model")
                .prompt_flag("-p")
                .static_models(&["sonnet", "opus", "haiku"])
                .escalation_flag("--dangerously-skip-permissions"),
            ToolDefinition::cli("codex", "codex", "codex exec")
                .model_flag("--model")
                .escalation_flag("--dangerously-bypass-approvals-and-sandbox")
                .extra_args(&["--color", "never"]),
            ToolDefinition::cli("gemini", "gemini", "gemini")
                .model_flag("--model")
                .prompt_flag("-p")
                .static_models(&["gemini-2.5-pro", "gemini-2.5-flash"])
                .escalation_flag("--yolo"),
            ToolDefinition::app("cursor-app", "Cursor", "cursor"),
            ToolDefinition::web("chatgpt", "ChatGPT", "https://chatgpt.com"),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name.as_str()).collect()
    }
}
