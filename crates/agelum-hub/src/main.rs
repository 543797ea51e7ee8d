use agelum_core::{SettingsFile, ToolCatalog};
use agelum_hub::{serve, HubOptions, HubState};
use agelum_runner::{
    HistoryStore, HostConfig, SearchPath, DEFAULT_RETENTION, DEFAULT_TRANSCRIPT_CAP,
};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info, warn};

mod logging;

const DEFAULT_ADDR: &str = "127.0.0.1:4317";
const DEFAULT_LOG_DIR: &str = ".agelum/logs";

#[derive(Parser, Debug)]
#[command(name = "agelum-hub", about = "Loopback backend that runs agent tools")]
struct Args {
    /// Listen address; must be loopback (falls back to AGELUM_HUB_ADDR).
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long)]
    debug: bool,
    /// Log directory (falls back to AGELUM_LOG_DIR).
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Settings file (falls back to AGELUM_SETTINGS).
    #[arg(long, default_value = "")]
    settings: String,
    /// History file (falls back to AGELUM_HISTORY).
    #[arg(long, default_value = "")]
    history: String,
    /// Use piped stdio instead of a PTY (also AGELUM_PTY=0).
    #[arg(long)]
    no_pty: bool,
    /// How long finished sessions stay resumable.
    #[arg(long, default_value_t = DEFAULT_RETENTION.as_secs())]
    retention_secs: u64,
    /// Bytes of transcript kept per session.
    #[arg(long, default_value_t = DEFAULT_TRANSCRIPT_CAP)]
    transcript_cap: usize,
}

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    level: String,
    log_dir: String,
    settings_path: Option<PathBuf>,
    history_path: PathBuf,
    host: HostConfig,
}

impl Config {
    fn from_args(args: Args) -> Self {
        let level = if args.debug || env_flag("AGELUM_HUB_DEBUG").unwrap_or(false) {
            "debug".to_string()
        } else {
            env_value("AGELUM_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
        };
        Self {
            addr: flag_or_env(&args.addr, "AGELUM_HUB_ADDR")
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            level,
            log_dir: flag_or_env(&args.log_dir, "AGELUM_LOG_DIR")
                .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            settings_path: flag_or_env(&args.settings, "AGELUM_SETTINGS")
                .map(PathBuf::from)
                .or_else(SettingsFile::default_path),
            history_path: flag_or_env(&args.history, "AGELUM_HISTORY")
                .map(PathBuf::from)
                .or_else(HistoryStore::default_path)
                .unwrap_or_else(|| PathBuf::from(".agelum").join("history.json")),
            host: HostConfig {
                use_pty: !args.no_pty && env_flag("AGELUM_PTY").unwrap_or(true),
                transcript_cap: args.transcript_cap,
                retention: Duration::from_secs(args.retention_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_args(Args::parse());
    let log_guard = logging::init(&config.level, &config.log_dir, &config.addr);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "invalid_addr", addr = %config.addr, error = %err);
            return ExitCode::FAILURE;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "not loopback");
        return ExitCode::FAILURE;
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", addr = %addr, error = %err);
            return ExitCode::FAILURE;
        }
    };

    info!(
        event = "hub_config",
        addr = %addr,
        pty = config.host.use_pty,
        history = %config.history_path.display(),
        retention_secs = config.host.retention.as_secs(),
        log_file = ?log_guard.as_ref().and_then(|guard| guard.path.as_ref())
    );

    let hub = Arc::new(HubState::new(HubOptions {
        catalog: ToolCatalog::builtin(),
        search: SearchPath::from_env(),
        host: config.host,
        settings_path: config.settings_path,
        history_path: config.history_path,
    }));
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_error", error = %err);
        }
    };
    match serve(listener, hub, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    if flag.trim().is_empty() {
        env_value(key)
    } else {
        Some(flag.to_string())
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let value = env_value(key)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(event = "invalid_env_flag", key, value = %value);
            None
        }
    }
}
