use crate::resolver::SearchPath;
use agelum_core::wire::RunResponse;
use agelum_core::{compile, AgentError, CompileRequest};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const BATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

enum Outcome {
    Exited(Option<i32>),
    WaitFailed(String),
    TimedOut,
}

/// Bounded, non-interactive tool runs. Every outcome, including spawn errors
/// and timeouts, is returned as a [`RunResponse`].
#[derive(Debug, Clone)]
pub struct BatchRunner {
    search: SearchPath,
    timeout: Duration,
}

impl BatchRunner {
    pub fn new(search: SearchPath) -> Self {
        Self {
            search,
            timeout: BATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self, request: &CompileRequest<'_>, cwd: Option<&Path>) -> RunResponse {
        let tool = request.tool;
        let compiled = match compile(request) {
            Ok(compiled) => compiled,
            Err(err) => return failure(String::new(), err.to_string()),
        };
        if !self.search.is_available(&compiled.command) {
            return failure(
                String::new(),
                AgentError::ToolUnavailable(tool.name.clone()).to_string(),
            );
        }

        let program = self.search.resolve_path(&compiled.command);
        info!(event = "batch_spawn", tool = %tool.name, program = %program);
        let mut command = Command::new(&program);
        command
            .args(&compiled.args)
            .env("PATH", self.search.to_env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return failure(String::new(), err.to_string()),
        };
        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        // Whichever branch wins is the only resolution; a late exit after the
        // timer fired is never observed.
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status.code()),
                Err(err) => Outcome::WaitFailed(err.to_string()),
            },
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
        };
        if matches!(outcome, Outcome::TimedOut) {
            if let Err(err) = child.kill().await {
                warn!(event = "batch_kill_failed", tool = %tool.name, error = %err);
            }
        }

        let output = drain(stdout).await;
        let errors = drain(stderr).await;
        match outcome {
            Outcome::Exited(Some(0)) => RunResponse {
                success: true,
                output,
                error: None,
            },
            Outcome::Exited(code) => {
                let error = if errors.is_empty() {
                    match code {
                        Some(code) => format!("Process exited with code {code}"),
                        None => "Process terminated by signal".to_string(),
                    }
                } else {
                    errors
                };
                failure(output, error)
            }
            Outcome::WaitFailed(err) => failure(output, err),
            Outcome::TimedOut => {
                warn!(event = "batch_timeout", tool = %tool.name, timeout_secs = self.timeout.as_secs());
                failure(
                    output,
                    AgentError::Timeout {
                        minutes: (self.timeout.as_secs() / 60).max(1),
                    }
                    .to_string(),
                )
            }
        }
    }
}

fn failure(output: String, error: String) -> RunResponse {
    RunResponse {
        success: false,
        output,
        error: Some(error),
    }
}

struct Capture {
    buf: Arc<StdMutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

fn collect<R>(mut reader: R) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(StdMutex::new(Vec::new()));
    let sink = buf.clone();
    let task = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if let Ok(mut sink) = sink.lock() {
                        sink.extend_from_slice(&chunk[..count]);
                    }
                }
            }
        }
    });
    Capture { buf, task }
}

/// Waits briefly for a reader to hit EOF, then takes whatever arrived;
/// grandchildren holding the pipe open must not stall the result.
async fn drain(capture: Option<Capture>) -> String {
    let Some(mut capture) = capture else {
        return String::new();
    };
    if tokio::time::timeout(DRAIN_GRACE, &mut capture.task)
        .await
        .is_err()
    {
        capture.task.abort();
    }
    let bytes = match capture.buf.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).to_string()
}
