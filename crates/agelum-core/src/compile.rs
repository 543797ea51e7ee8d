use crate::error::AgentError;
use crate::settings::{non_empty, split_cli_parameters, ToolSettings};
use crate::{ToolDefinition, ToolKind};
use serde::{Deserialize, Serialize};

pub const PERMISSION_NOTICE_BODY: &str =
    "[Permissions: You are allowed to modify files and run commands in this project.]";
pub const PERMISSION_NOTICE: &str =
    "\n\n[Permissions: You are allowed to modify files and run commands in this project.]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl CompiledCommand {
    /// Shell-quoted rendering, for display only.
    pub fn to_shell_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.command.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub tool: &'a ToolDefinition,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub allow_modify: Option<bool>,
    pub settings: Option<&'a ToolSettings>,
    pub workflow: Option<&'a str>,
}

impl<'a> CompileRequest<'a> {
    pub fn new(tool: &'a ToolDefinition, prompt: &'a str) -> Self {
        Self {
            tool,
            prompt,
            model: None,
            allow_modify: None,
            settings: None,
            workflow: None,
        }
    }

    pub fn resolve(&self) -> ResolvedOptions {
        let override_ = self
            .settings
            .and_then(|settings| settings.workflow(self.workflow));

        let model = non_empty(self.model)
            .or_else(|| non_empty(override_.and_then(|o| o.default_model.as_deref())))
            .or_else(|| non_empty(self.settings.and_then(|s| s.default_model.as_deref())))
            .map(str::to_string);

        let allow_modify = self.allow_modify.unwrap_or(false)
            || override_
                .and_then(|o| o.default_permissions)
                .unwrap_or(false)
            || self.settings.map(|s| s.default_permissions).unwrap_or(false);

        let cli_parameters = non_empty(override_.and_then(|o| o.cli_parameters.as_deref()))
            .or_else(|| non_empty(self.settings.and_then(|s| s.cli_parameters.as_deref())))
            .map(split_cli_parameters)
            .unwrap_or_default();

        ResolvedOptions {
            model,
            allow_modify,
            cli_parameters,
        }
    }
}

/// Effective invocation options after layering explicit, workflow and tool
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub model: Option<String>,
    pub allow_modify: bool,
    pub cli_parameters: Vec<String>,
}

pub fn annotate_prompt(prompt: &str) -> String {
    if prompt.contains(PERMISSION_NOTICE_BODY) {
        prompt.to_string()
    } else {
        format!("{prompt}{PERMISSION_NOTICE}")
    }
}

/// Builds the command line for one invocation. Pure: identical requests give
/// identical output.
pub fn compile(request: &CompileRequest<'_>) -> Result<CompiledCommand, AgentError> {
    let tool = request.tool;
    let program = match &tool.kind {
        ToolKind::Web { .. } => return Err(AgentError::NotSpawnable(tool.name.clone())),
        ToolKind::Cli | ToolKind::App => tool
            .program()
            .ok_or_else(|| AgentError::ToolUnavailable(tool.name.clone()))?,
    };
    let resolved = request.resolve();

    let mut args = tool.base_args();
    args.extend(resolved.cli_parameters.iter().cloned());
    args.extend(tool.extra_args.iter().cloned());

    let prompt = if resolved.allow_modify {
        if let Some(flag) = &tool.escalation_flag {
            args.push(flag.clone());
        }
        annotate_prompt(request.prompt)
    } else {
        request.prompt.to_string()
    };

    if let (Some(flag), Some(model)) = (&tool.model_flag, &resolved.model) {
        args.push(flag.clone());
        args.push(model.clone());
    }
    if let Some(flag) = &tool.prompt_flag {
        args.push(flag.clone());
    }
    args.push(prompt);

    Ok(CompiledCommand {
        command: program.to_string(),
        args,
    })
}
