use crate::output_log::{LogReader, OutputLog, DEFAULT_TRANSCRIPT_CAP};
use agelum_core::session::{new_process_id, now_ms};
use agelum_core::wire::SessionStatus;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);
const READER_GRACE: Duration = Duration::from_secs(1);
const KILL_GRACE: Duration = Duration::from_millis(500);
const CTRL_C: u8 = 0x03;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("unknown process: {0}")]
    UnknownProcess(String),
    #[error("process {0} is not running")]
    NotRunning(String),
    #[error("input write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub use_pty: bool,
    pub transcript_cap: usize,
    pub retention: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            use_pty: true,
            transcript_cap: DEFAULT_TRANSCRIPT_CAP,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Everything needed to start one interactive process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub tool_name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub path_env: Option<OsString>,
}

enum InputSink {
    Pty(Arc<StdMutex<Box<dyn Write + Send>>>),
    Pipe(ChildStdin),
}

#[derive(Debug, Default, Clone, Copy)]
struct Lifecycle {
    exit_code: Option<i32>,
    finished_at: Option<Instant>,
}

/// Server-side record of one spawn: output transcript, input side-channel and
/// termination handle.
pub struct ManagedProcess {
    pub id: String,
    pub tool_name: String,
    pub started_at: i64,
    log: Arc<OutputLog>,
    input: Mutex<Option<InputSink>>,
    lifecycle: StdMutex<Lifecycle>,
    kill: CancellationToken,
}

impl ManagedProcess {
    fn new(tool_name: &str, cap: usize) -> Self {
        Self {
            id: new_process_id(),
            tool_name: tool_name.to_string(),
            started_at: now_ms(),
            log: OutputLog::new(cap),
            input: Mutex::new(None),
            lifecycle: StdMutex::new(Lifecycle::default()),
            kill: CancellationToken::new(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle().finished_at.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lifecycle().exit_code
    }

    fn finished_for(&self) -> Option<Duration> {
        self.lifecycle().finished_at.map(|at| at.elapsed())
    }

    pub fn output(&self) -> &Arc<OutputLog> {
        &self.log
    }

    pub fn reader(&self, from: u64) -> LogReader {
        self.log.reader(from)
    }

    pub fn status(&self) -> SessionStatus {
        let lifecycle = *self.lifecycle();
        SessionStatus {
            alive: lifecycle.finished_at.is_none(),
            exit_code: lifecycle.exit_code,
            tool_name: self.tool_name.clone(),
            started_at: self.started_at,
            transcript_bytes: self.log.total_bytes(),
        }
    }

    pub async fn write_input(&self, data: &[u8]) -> Result<(), InputError> {
        let mut input = self.input.lock().await;
        match input.as_mut() {
            None => Err(InputError::NotRunning(self.id.clone())),
            Some(InputSink::Pipe(stdin)) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            Some(InputSink::Pty(writer)) => {
                let mut writer = match writer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                writer.write_all(data)?;
                writer.flush()?;
                Ok(())
            }
        }
    }

    /// Soft interrupt: relays ^C without tearing the session down.
    pub async fn interrupt(&self) -> Result<(), InputError> {
        self.write_input(&[CTRL_C]).await
    }

    /// Requests termination. Safe to call any number of times, including
    /// after the process already exited.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    async fn finish(&self, exit_code: Option<i32>, message: Option<String>) {
        self.input.lock().await.take();
        if let Some(message) = message {
            self.log.append(message.as_bytes());
        }
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.exit_code = exit_code;
            lifecycle.finished_at = Some(Instant::now());
        }
        // Readers observe the close only after the exit state is recorded.
        self.log.close();
    }
}

/// Owns every interactive process started by the hub.
pub struct ProcessHost {
    config: HostConfig,
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
}

impl ProcessHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Starts a process and registers it. Spawn errors do not fail the call:
    /// they produce a finished session whose transcript carries the reason.
    pub async fn spawn(&self, spec: SpawnSpec) -> Arc<ManagedProcess> {
        let process = Arc::new(ManagedProcess::new(&spec.tool_name, self.config.transcript_cap));
        self.processes
            .write()
            .await
            .insert(process.id.clone(), process.clone());

        let started = if self.config.use_pty {
            match start_pty(&spec, process.clone()).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(event = "pty_spawn_failed", process_id = %process.id, error = %err);
                    start_piped(&spec, process.clone()).await
                }
            }
        } else {
            start_piped(&spec, process.clone()).await
        };

        match started {
            Ok(()) => {
                info!(
                    event = "process_spawned",
                    process_id = %process.id,
                    tool = %spec.tool_name,
                    program = %spec.program
                );
            }
            Err(err) => {
                warn!(event = "process_spawn_failed", process_id = %process.id, error = %err);
                process
                    .finish(None, Some(format!("Failed to start process: {err}")))
                    .await;
            }
        }
        process
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(id).cloned()
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        self.get(id).await.map(|process| process.status())
    }

    pub async fn write_input(&self, id: &str, data: &[u8]) -> Result<(), InputError> {
        let process = self
            .get(id)
            .await
            .ok_or_else(|| InputError::UnknownProcess(id.to_string()))?;
        process.write_input(data).await
    }

    /// Returns false when the id is unknown.
    pub async fn terminate(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(process) => {
                debug!(event = "process_terminate", process_id = %id);
                process.terminate();
                true
            }
            None => false,
        }
    }

    pub async fn terminate_all(&self) {
        for process in self.processes.read().await.values() {
            process.terminate();
        }
    }

    /// Drops finished processes older than the retention window.
    pub async fn prune_finished(&self) -> usize {
        let retention = self.config.retention;
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|_, process| match process.finished_for() {
            Some(age) => age < retention,
            None => true,
        });
        before - processes.len()
    }

    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let host = self.clone();
        let interval = (self.config.retention / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let pruned = host.prune_finished().await;
                if pruned > 0 {
                    debug!(event = "process_reaped", count = pruned);
                }
            }
        })
    }
}

fn other_io(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

async fn start_pty(spec: &SpawnSpec, process: Arc<ManagedProcess>) -> io::Result<()> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: spec.rows.max(1),
            cols: spec.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(other_io)?;

    let mut builder = CommandBuilder::new(&spec.program);
    builder.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        builder.cwd(cwd);
    }
    builder.env("TERM", "xterm-256color");
    builder.env("FORCE_COLOR", "1");
    builder.env("COLUMNS", spec.cols.to_string());
    builder.env("LINES", spec.rows.to_string());
    if let Some(path) = &spec.path_env {
        builder.env("PATH", path);
    }

    let mut child = pair.slave.spawn_command(builder).map_err(other_io)?;
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader().map_err(other_io)?;
    let writer = pair.master.take_writer().map_err(other_io)?;
    let killer = child.clone_killer();
    let pid = child.process_id();
    *process.input.lock().await = Some(InputSink::Pty(Arc::new(StdMutex::new(writer))));

    let log = process.log.clone();
    let (read_done_tx, read_done_rx) = oneshot::channel::<()>();
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(count) => log.append(&buffer[..count]),
            }
        }
        let _ = read_done_tx.send(());
    });

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => 1,
        };
        let _ = exit_tx.send(code);
    });

    tokio::spawn(supervise_pty(process, pair.master, killer, pid, exit_rx, read_done_rx));
    Ok(())
}

async fn supervise_pty(
    process: Arc<ManagedProcess>,
    master: Box<dyn MasterPty + Send>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    mut exit_rx: oneshot::Receiver<i32>,
    read_done_rx: oneshot::Receiver<()>,
) {
    let (code, cancelled) = tokio::select! {
        code = &mut exit_rx => (code.unwrap_or(1), false),
        _ = process.kill.cancelled() => {
            // The pty killer only delivers SIGHUP, which a tool may ignore.
            if let Err(err) = killer.kill() {
                debug!(event = "process_kill_ignored", process_id = %process.id, error = %err);
            }
            let code = match tokio::time::timeout(KILL_GRACE, &mut exit_rx).await {
                Ok(code) => code.unwrap_or(1),
                Err(_) => {
                    warn!(event = "process_kill_escalated", process_id = %process.id, pid = ?pid);
                    force_kill(pid);
                    exit_rx.await.unwrap_or(1)
                }
            };
            (code, true)
        }
    };
    // Output still buffered in the pty is drained before the transcript closes.
    let _ = tokio::time::timeout(READER_GRACE, read_done_rx).await;
    drop(master);
    conclude(&process, code, cancelled).await;
}

/// SIGKILL for the whole pty session. The child leads its own session, so its
/// pid doubles as the process group id.
#[cfg(unix)]
fn force_kill(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    unsafe {
        if libc::killpg(pid, libc::SIGKILL) == -1 {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: Option<u32>) {}

async fn start_piped(spec: &SpawnSpec, process: Arc<ManagedProcess>) -> io::Result<()> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .env("COLUMNS", spec.cols.to_string())
        .env("LINES", spec.rows.to_string())
        .env("FORCE_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if let Some(path) = &spec.path_env {
        command.env("PATH", path);
    }

    let mut child = command.spawn()?;
    if let Some(stdin) = child.stdin.take() {
        *process.input.lock().await = Some(InputSink::Pipe(stdin));
    }
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, process.log.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, process.log.clone()));
    }

    tokio::spawn(async move {
        let (status, cancelled) = tokio::select! {
            status = child.wait() => (status, false),
            _ = process.kill.cancelled() => {
                if let Err(err) = child.start_kill() {
                    debug!(event = "process_kill_ignored", process_id = %process.id, error = %err);
                }
                (child.wait().await, true)
            }
        };
        let code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        };
        for pump in pumps {
            let _ = tokio::time::timeout(READER_GRACE, pump).await;
        }
        conclude(&process, code, cancelled).await;
    });
    Ok(())
}

fn pump<R>(mut reader: R, log: Arc<OutputLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(count) => log.append(&buffer[..count]),
            }
        }
    })
}

async fn conclude(process: &ManagedProcess, code: i32, cancelled: bool) {
    info!(
        event = "process_exited",
        process_id = %process.id,
        exit_code = code,
        cancelled
    );
    let message = (!cancelled && code != 0).then(|| format!("\nProcess exited with code {code}"));
    process.finish(Some(code), message).await;
}
