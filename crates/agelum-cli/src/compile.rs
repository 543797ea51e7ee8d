use crate::agent::PromptArgs;
use crate::resolve_value;
use agelum_core::{compile, AgentError, CompileRequest, SettingsFile, ToolCatalog};
use anyhow::Result;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CompileArgs {
    #[command(flatten)]
    pub prompt: PromptArgs,
    /// Settings file (falls back to AGELUM_SETTINGS, then ~/.agelum/settings.json).
    #[arg(long, default_value = "")]
    pub settings: String,
    #[arg(long)]
    pub json: bool,
}

/// Compiles locally against the built-in catalog; no hub involved.
pub fn run(args: CompileArgs) -> Result<()> {
    let catalog = ToolCatalog::builtin();
    let tool = catalog
        .get(&args.prompt.tool)
        .ok_or_else(|| AgentError::UnknownTool(args.prompt.tool.clone()))?;

    let settings = resolve_value(&args.settings, std::env::var("AGELUM_SETTINGS").ok())
        .map(PathBuf::from)
        .or_else(SettingsFile::default_path)
        .map(|path| SettingsFile::load(&path))
        .unwrap_or_default();

    let request = CompileRequest {
        model: args.prompt.model.as_deref(),
        allow_modify: args.prompt.allow_modify(),
        settings: settings.tool(&tool.name),
        workflow: args.prompt.workflow.as_deref(),
        ..CompileRequest::new(tool, &args.prompt.prompt)
    };
    let resolved = request.resolve();
    let compiled = compile(&request)?;

    if args.json {
        let payload = json!({
            "command": compiled.command,
            "args": compiled.args,
            "model": resolved.model,
            "allowModify": resolved.allow_modify,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", compiled.to_shell_line());
    }
    Ok(())
}
