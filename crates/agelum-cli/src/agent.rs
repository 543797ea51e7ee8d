use agelum_client::{
    Backend, BackendMtimeProbe, FsMtimeProbe, HttpBackend, LaunchOptions, MtimeProbe,
    SessionStore, SlotController, SlotEvent, SlotState,
};
use agelum_core::wire::RunRequest;
use agelum_core::{HistoryEntry, SessionPatch};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Args, Debug)]
pub struct OutputArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ModelsArgs {
    pub tool: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PromptArgs {
    #[arg(long)]
    pub tool: String,
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub model: Option<String>,
    /// Grant the tool permission to modify files and run commands.
    #[arg(long)]
    pub allow_modify: bool,
    #[arg(long)]
    pub workflow: Option<String>,
    #[arg(long)]
    pub cwd: Option<String>,
}

impl PromptArgs {
    // An absent flag leaves the decision to settings.
    pub fn allow_modify(&self) -> Option<bool> {
        self.allow_modify.then_some(true)
    }

    fn run_request(&self) -> RunRequest {
        RunRequest {
            tool: self.tool.clone(),
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            allow_modify: self.allow_modify(),
            workflow: self.workflow.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub prompt: PromptArgs,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LaunchArgs {
    #[command(flatten)]
    pub prompt: PromptArgs,
    /// Slot the session is bound to, usually the file being edited.
    #[arg(long)]
    pub context: String,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub file: Option<String>,
    #[arg(long)]
    pub cols: Option<u16>,
    #[arg(long)]
    pub rows: Option<u16>,
    /// Paths to watch for external modification while the session runs.
    #[arg(long)]
    pub watch: Vec<String>,
    /// Stat watched paths locally instead of asking the hub.
    #[arg(long)]
    pub local_watch: bool,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    #[arg(long)]
    pub context: String,
    #[arg(long)]
    pub watch: Vec<String>,
    #[arg(long)]
    pub local_watch: bool,
}

#[derive(Args, Debug)]
pub struct ContextArgs {
    #[arg(long)]
    pub context: String,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    #[arg(long)]
    pub context: Option<String>,
    #[arg(long)]
    pub json: bool,
}

fn connect(hub: &str) -> Result<Arc<HttpBackend>> {
    let backend =
        HttpBackend::new(hub).with_context(|| format!("Invalid hub url: {hub}"))?;
    debug!(event = "hub_connect", hub);
    Ok(Arc::new(backend))
}

fn load_store(path: &Path) -> Result<Arc<SessionStore>> {
    let store = SessionStore::load(path)
        .with_context(|| format!("Failed to read sessions from {}", path.display()))?;
    Ok(Arc::new(store))
}

fn save_store(store: &SessionStore, path: &Path) -> Result<()> {
    store
        .save(path)
        .with_context(|| format!("Failed to write sessions to {}", path.display()))
}

pub async fn tools(hub: &str, args: OutputArgs) -> Result<()> {
    let tools = connect(hub)?.list_tools().await.context("Failed to list tools")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    for tool in tools {
        let status = if tool.available { "available" } else { "missing" };
        println!("{:<12} {:<4} {status}", tool.name, tool.kind);
    }
    Ok(())
}

pub async fn models(hub: &str, args: ModelsArgs) -> Result<()> {
    let models = connect(hub)?
        .list_models(&args.tool)
        .await
        .with_context(|| format!("Failed to list models for {}", args.tool))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&models)?);
    } else if models.is_empty() {
        println!("No models available for {}", args.tool);
    } else {
        for model in models {
            println!("{model}");
        }
    }
    Ok(())
}

pub async fn run(hub: &str, args: RunArgs) -> Result<()> {
    let response = connect(hub)?
        .run(&args.prompt.run_request())
        .await
        .context("Failed to reach hub")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    print!("{}", response.output);
    if !response.success {
        bail!(response.error.unwrap_or_else(|| "Run failed".to_string()));
    }
    Ok(())
}

pub async fn launch(hub: &str, sessions: &Path, args: LaunchArgs) -> Result<()> {
    let backend = connect(hub)?;
    let store = load_store(sessions)?;
    let (slot, events) = SlotController::new(backend.clone(), store.clone(), args.context.clone());

    let options = LaunchOptions {
        model: args.prompt.model.clone(),
        allow_modify: args.prompt.allow_modify(),
        workflow: args.prompt.workflow.clone(),
        cwd: args.prompt.cwd.clone(),
        cols: args.cols,
        rows: args.rows,
        project_name: args.project.clone(),
        file_path: args.file.clone(),
        ..LaunchOptions::new(&args.prompt.tool, &args.prompt.prompt)
    };
    let process_id = match slot.launch(options).await {
        Ok(process_id) => process_id,
        Err(err) => {
            eprintln!("{}", slot.transcript());
            return Err(err).context("Launch failed");
        }
    };
    save_store(&store, sessions)?;
    eprintln!("session {process_id} started for {}", args.context);

    if !args.watch.is_empty() {
        let probe = watch_probe(&backend, args.local_watch);
        slot.watch(probe, args.watch.clone()).await;
    }
    drive(&slot, events).await?;
    save_store(&store, sessions)
}

pub async fn attach(hub: &str, sessions: &Path, args: AttachArgs) -> Result<()> {
    let backend = connect(hub)?;
    let store = load_store(sessions)?;
    let (slot, events) = SlotController::new(backend.clone(), store.clone(), args.context.clone());
    if !slot.reconnect().await {
        save_store(&store, sessions)?;
        println!("No running session for {}", args.context);
        return Ok(());
    }
    if !args.watch.is_empty() {
        let probe = watch_probe(&backend, args.local_watch);
        slot.watch(probe, args.watch.clone()).await;
    }
    drive(&slot, events).await?;
    save_store(&store, sessions)
}

pub async fn cancel(hub: &str, sessions: &Path, args: ContextArgs) -> Result<()> {
    let backend = connect(hub)?;
    let store = load_store(sessions)?;
    let Some(session) = store.get(&args.context) else {
        println!("No session for {}", args.context);
        return Ok(());
    };
    let found = backend
        .terminate(&session.process_id)
        .await
        .context("Failed to reach hub")?;
    store.update(&session.process_id, SessionPatch::finished());
    save_store(&store, sessions)?;
    if found {
        println!("Terminated {}", session.process_id);
    } else {
        println!("Session {} was already gone", session.process_id);
    }
    Ok(())
}

pub async fn sessions(hub: &str, sessions: &Path, args: OutputArgs) -> Result<()> {
    let backend = connect(hub)?;
    let store = load_store(sessions)?;
    let mut rows = Vec::new();
    for session in store.snapshot() {
        let alive = match backend.status(&session.process_id).await {
            Ok(status) => status.alive,
            Err(_) => false,
        };
        rows.push((session, alive));
    }
    if args.json {
        let payload: Vec<_> = rows
            .iter()
            .map(|(session, alive)| json!({ "session": session, "alive": alive }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No sessions registered.");
    }
    for (session, alive) in rows {
        let state = match (session.is_running, alive) {
            (true, true) => "running",
            (true, false) => "lost",
            (false, _) => "finished",
        };
        println!(
            "{:<24} {:<10} {:<8} {}",
            session.context_key, session.tool_name, state, session.process_id
        );
    }
    Ok(())
}

pub async fn history(hub: &str, args: HistoryArgs) -> Result<()> {
    let entries: Vec<HistoryEntry> = connect(hub)?
        .history()
        .await
        .context("Failed to read history")?
        .into_iter()
        .filter(|entry| {
            args.context
                .as_deref()
                .map_or(true, |context| entry.context_key == context)
        })
        .take(args.limit)
        .collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No history.");
    }
    for entry in entries {
        println!(
            "{}  {:<10} {:<24} {}",
            format_started(entry.started_at),
            entry.tool_name,
            entry.context_key,
            summarize_prompt(&entry.prompt, 60)
        );
    }
    Ok(())
}

fn watch_probe(backend: &Arc<HttpBackend>, local: bool) -> Arc<dyn MtimeProbe> {
    if local {
        Arc::new(FsMtimeProbe)
    } else {
        Arc::new(BackendMtimeProbe::new(backend.clone()))
    }
}

/// Prints slot events until the session finishes. Stdin lines are relayed
/// as input; the first Ctrl-C interrupts the tool, the second detaches and
/// leaves it running.
async fn drive(slot: &SlotController, mut events: mpsc::UnboundedReceiver<SlotEvent>) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interrupts = 0u8;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SlotEvent::Output(text)) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
                Some(SlotEvent::Modified(change)) => {
                    eprintln!("[modified] {}", change.path);
                }
                Some(SlotEvent::Finished { state, .. }) => {
                    writeln!(stdout)?;
                    if state == SlotState::Cancelled {
                        eprintln!("session cancelled");
                    }
                    return Ok(());
                }
                Some(SlotEvent::Reset) | Some(SlotEvent::Started { .. }) => {}
                None => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    slot.send_input(&format!("{line}\n")).await.context("Failed to send input")?;
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupts += 1;
                if interrupts >= 2 {
                    slot.detach().await;
                    eprintln!(
                        "\ndetached; reattach with `agelum attach --context {}`",
                        slot.context_key()
                    );
                    return Ok(());
                }
                slot.interrupt().await.context("Failed to interrupt")?;
                eprintln!("\ninterrupt sent (Ctrl-C again to detach)");
            }
        }
    }
}

fn format_started(started_at: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(started_at)
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn summarize_prompt(prompt: &str, limit: usize) -> String {
    let line = prompt.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= limit {
        return line.to_string();
    }
    let cut: String = line.chars().take(limit.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_modify_flag_only_ever_grants() {
        let mut args = PromptArgs {
            tool: "claude".to_string(),
            prompt: "x".to_string(),
            model: None,
            allow_modify: false,
            workflow: None,
            cwd: None,
        };
        assert_eq!(args.run_request().allow_modify, None);
        args.allow_modify = true;
        assert_eq!(args.run_request().allow_modify, Some(true));
    }

    #[test]
    fn prompt_summary_uses_first_line() {
        assert_eq!(summarize_prompt("fix it\nmore detail", 60), "fix it");
        assert_eq!(summarize_prompt("abcdefghij", 6), "abc...");
        assert_eq!(summarize_prompt("", 6), "");
    }

    #[test]
    fn started_at_formats_as_utc_minutes() {
        assert_eq!(format_started(0), "1970-01-01 00:00");
    }
}
