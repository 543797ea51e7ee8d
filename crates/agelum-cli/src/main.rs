use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod agent;
mod compile;

use agent::{
    AttachArgs, ContextArgs, HistoryArgs, LaunchArgs, ModelsArgs, OutputArgs, RunArgs,
};
use compile::CompileArgs;

#[derive(Parser)]
#[command(name = "agelum")]
#[command(about = "Agelum agent tool runner", long_about = None)]
struct Cli {
    /// Hub base URL (falls back to AGELUM_HUB_URL).
    #[arg(long, global = true, default_value = "")]
    hub: String,
    /// Session registry file (falls back to AGELUM_SESSIONS).
    #[arg(long, global = true, default_value = "")]
    sessions: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// List tools and whether they are installed
    Tools(OutputArgs),
    /// List models a tool offers
    Models(ModelsArgs),
    /// Run a prompt to completion and print the result
    Run(RunArgs),
    /// Start an interactive session bound to a context key
    Launch(LaunchArgs),
    /// Reattach to the running session for a context key
    Attach(AttachArgs),
    /// Terminate the session for a context key
    Cancel(ContextArgs),
    /// Show registered sessions and whether they are alive
    Sessions(OutputArgs),
    /// Show launch history
    History(HistoryArgs),
    /// Print the command line a prompt compiles to
    Compile(CompileArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let hub = resolve_hub_url(&cli.hub);
    let sessions = resolve_sessions_path(&cli.sessions);

    match cli.command {
        Commands::Tools(args) => agent::tools(&hub, args).await,
        Commands::Models(args) => agent::models(&hub, args).await,
        Commands::Run(args) => agent::run(&hub, args).await,
        Commands::Launch(args) => agent::launch(&hub, &sessions, args).await,
        Commands::Attach(args) => agent::attach(&hub, &sessions, args).await,
        Commands::Cancel(args) => agent::cancel(&hub, &sessions, args).await,
        Commands::Sessions(args) => agent::sessions(&hub, &sessions, args).await,
        Commands::History(args) => agent::history(&hub, args).await,
        Commands::Compile(args) => compile::run(args),
    }
}

fn init_logging() {
    let level = std::env::var("AGELUM_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_hub_url(flag: &str) -> String {
    resolve_value(flag, std::env::var("AGELUM_HUB_URL").ok())
        .unwrap_or_else(|| agelum_client::DEFAULT_HUB_URL.to_string())
}

fn resolve_sessions_path(flag: &str) -> PathBuf {
    resolve_value(flag, std::env::var("AGELUM_SESSIONS").ok())
        .map(PathBuf::from)
        .or_else(agelum_client::SessionStore::default_path)
        .unwrap_or_else(|| PathBuf::from(".agelum").join(agelum_client::registry::SESSIONS_FILE))
}

fn resolve_value(flag: &str, env: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_env_and_blank_values_are_ignored() {
        assert_eq!(
            resolve_value("http://a", Some("http://b".to_string())).as_deref(),
            Some("http://a")
        );
        assert_eq!(
            resolve_value("  ", Some("http://b".to_string())).as_deref(),
            Some("http://b")
        );
        assert_eq!(resolve_value("", Some(" ".to_string())), None);
        assert_eq!(resolve_value("", None), None);
    }

    #[test]
    fn cli_parses_launch_with_watch_paths() {
        let cli = Cli::try_parse_from([
            "agelum",
            "launch",
            "--tool",
            "claude",
            "--prompt",
            "plan it",
            "--context",
            "docs/a.md",
            "--watch",
            "docs/a.md",
            "--watch",
            "PLAN.md",
        ])
        .unwrap();
        let Commands::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.context, "docs/a.md");
        assert_eq!(args.watch, vec!["docs/a.md", "PLAN.md"]);
    }
}
