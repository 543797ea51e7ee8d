use crate::backend::{Backend, ByteStream, OutputStream};
use crate::reconnect::{reconnect, ReconnectOutcome};
use crate::registry::SessionStore;
use crate::watcher::{ArtifactWatcher, MtimeProbe, WatchEvent, DEFAULT_WATCH_INTERVAL};
use crate::ClientError;
use agelum_core::wire::{LaunchRequest, RunRequest};
use agelum_core::{Session, SessionPatch};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Control byte relayed for a soft interrupt.
pub const INTERRUPT: &str = "\u{3}";

const CANCELLED: &str = "Cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    LaunchPending,
    Streaming,
    Completed,
    Cancelled,
}

impl SlotState {
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::LaunchPending | SlotState::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// Local output was discarded.
    Reset,
    Started { process_id: String, resumed: bool },
    Output(String),
    Modified(WatchEvent),
    Finished {
        process_id: Option<String>,
        state: SlotState,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub tool: String,
    pub prompt: String,
    pub model: Option<String>,
    pub allow_modify: Option<bool>,
    pub workflow: Option<String>,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub project_name: Option<String>,
    pub file_path: Option<String>,
}

impl LaunchOptions {
    pub fn new(tool: &str, prompt: &str) -> Self {
        Self {
            tool: tool.to_string(),
            prompt: prompt.to_string(),
            ..Self::default()
        }
    }

    pub fn request(&self) -> LaunchRequest {
        LaunchRequest {
            run: RunRequest {
                tool: self.tool.clone(),
                prompt: self.prompt.clone(),
                model: self.model.clone(),
                allow_modify: self.allow_modify,
                workflow: self.workflow.clone(),
                cwd: self.cwd.clone(),
            },
            cols: self.cols,
            rows: self.rows,
        }
    }
}

struct View {
    state: SlotState,
    process_id: Option<String>,
    transcript: String,
}

struct Shared {
    context_key: String,
    store: Arc<SessionStore>,
    events: mpsc::UnboundedSender<SlotEvent>,
    view: StdMutex<View>,
}

impl Shared {
    fn view(&self) -> MutexGuard<'_, View> {
        match self.view.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // Events are sent while the view lock is held so their order matches the
    // order of transcript mutations.
    fn emit(&self, event: SlotEvent) {
        let _ = self.events.send(event);
    }

    fn reset(&self, state: SlotState) {
        let mut view = self.view();
        view.transcript.clear();
        view.process_id = None;
        view.state = state;
        self.emit(SlotEvent::Reset);
    }

    fn set_idle(&self) {
        let mut view = self.view();
        view.state = SlotState::Idle;
        view.process_id = None;
    }

    fn start(&self, process_id: &str, resumed: bool) {
        let mut view = self.view();
        view.state = SlotState::Streaming;
        view.process_id = Some(process_id.to_string());
        self.emit(SlotEvent::Started {
            process_id: process_id.to_string(),
            resumed,
        });
    }

    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut view = self.view();
        view.transcript.push_str(text);
        self.emit(SlotEvent::Output(text.to_string()));
    }

    fn push_note(&self, view: &mut View, separator: &str, text: &str) {
        let chunk = if view.transcript.is_empty() {
            text.to_string()
        } else {
            format!("{separator}{text}")
        };
        view.transcript.push_str(&chunk);
        self.emit(SlotEvent::Output(chunk));
    }

    fn fail(&self, err: &ClientError) {
        let mut view = self.view();
        self.push_note(&mut view, "\n", &format!("Error: {err}"));
        view.state = SlotState::Completed;
        self.emit(SlotEvent::Finished {
            process_id: None,
            state: SlotState::Completed,
        });
    }

    /// Moves a streaming read for `process_id` to its final state. Returns
    /// false when the slot already moved on.
    fn conclude(&self, process_id: &str, state: SlotState) -> bool {
        let mut view = self.view();
        if view.state != SlotState::Streaming || view.process_id.as_deref() != Some(process_id) {
            return false;
        }
        if state == SlotState::Cancelled {
            self.push_note(&mut view, "\n\n", CANCELLED);
        }
        view.state = state;
        self.store.update(process_id, SessionPatch::finished());
        self.emit(SlotEvent::Finished {
            process_id: Some(process_id.to_string()),
            state,
        });
        true
    }
}

struct ActiveRead {
    process_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives the session shown in one UI slot.
///
/// At most one read loop is active per controller. Starting a launch
/// hard-cancels the previous read and waits for it before the new request
/// goes out.
pub struct SlotController {
    backend: Arc<dyn Backend>,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveRead>>,
    watcher: Mutex<Option<ArtifactWatcher>>,
    watch_interval: Duration,
}

impl SlotController {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<SessionStore>,
        context_key: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SlotEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            context_key: context_key.into(),
            store,
            events,
            view: StdMutex::new(View {
                state: SlotState::Idle,
                process_id: None,
                transcript: String::new(),
            }),
        });
        let controller = Self {
            backend,
            shared,
            active: Mutex::new(None),
            watcher: Mutex::new(None),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        };
        (controller, rx)
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn context_key(&self) -> &str {
        &self.shared.context_key
    }

    pub fn state(&self) -> SlotState {
        self.shared.view().state
    }

    pub fn process_id(&self) -> Option<String> {
        self.shared.view().process_id.clone()
    }

    pub fn transcript(&self) -> String {
        self.shared.view().transcript.clone()
    }

    /// Launches `options` in this slot and returns the correlation id.
    ///
    /// A failed launch leaves a diagnostic in the transcript and the slot
    /// in `Completed`.
    pub async fn launch(&self, options: LaunchOptions) -> Result<String, ClientError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.hard_cancel(previous).await;
        }
        self.stop_watching().await;
        self.shared.reset(SlotState::LaunchPending);

        let stream = match self.backend.launch(&options.request()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    event = "slot_launch_failed",
                    context_key = %self.shared.context_key,
                    tool = %options.tool,
                    error = %err
                );
                self.shared.fail(&err);
                return Err(err);
            }
        };

        let process_id = stream.process_id.clone();
        let session = Session::new(
            &process_id,
            &options.tool,
            &self.shared.context_key,
            &options.prompt,
        )
        .with_project(options.project_name.clone())
        .with_file(options.file_path.clone());
        let entry = session.to_history();
        self.shared.store.register(session);

        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.append_history(&entry).await {
                warn!(event = "history_append_failed", process_id = %entry.process_id, error = %err);
            }
        });

        info!(
            event = "slot_launch",
            context_key = %self.shared.context_key,
            process_id = %process_id,
            tool = %options.tool
        );
        *active = Some(self.start_read(stream, false));
        Ok(process_id)
    }

    /// Hard cancel: stops the local read, marks the session finished and
    /// requests termination. Returns false when nothing was streaming.
    pub async fn cancel(&self) -> bool {
        let previous = self.active.lock().await.take();
        self.stop_watching().await;
        match previous {
            Some(read) => self.hard_cancel(read).await,
            None => false,
        }
    }

    /// Stops reading locally and leaves the process running so it can be
    /// resumed later.
    pub async fn detach(&self) {
        let previous = self.active.lock().await.take();
        self.stop_watching().await;
        if let Some(read) = previous {
            self.detach_read(read).await;
        }
    }

    /// Soft interrupt. Returns false when no session is streaming.
    pub async fn interrupt(&self) -> Result<bool, ClientError> {
        self.send_input(INTERRUPT).await
    }

    pub async fn send_input(&self, data: &str) -> Result<bool, ClientError> {
        let process_id = {
            let view = self.shared.view();
            match (&view.state, &view.process_id) {
                (SlotState::Streaming, Some(process_id)) => process_id.clone(),
                _ => return Ok(false),
            }
        };
        self.backend.send_input(&process_id, data).await?;
        Ok(true)
    }

    /// Reattaches to the session registered for this slot's context key.
    /// Returns whether a stream was resumed; otherwise the slot is idle.
    pub async fn reconnect(&self) -> bool {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.detach_read(previous).await;
        }
        self.stop_watching().await;
        match reconnect(
            self.backend.as_ref(),
            &self.shared.store,
            &self.shared.context_key,
        )
        .await
        {
            ReconnectOutcome::Resumed(stream) => {
                self.shared.reset(SlotState::LaunchPending);
                *active = Some(self.start_read(stream, true));
                true
            }
            ReconnectOutcome::Purged { .. } | ReconnectOutcome::Idle => {
                self.shared.set_idle();
                false
            }
        }
    }

    /// Polls `paths` while the current session streams. Replaces any earlier
    /// watch; returns false when nothing is streaming.
    pub async fn watch(&self, probe: Arc<dyn MtimeProbe>, paths: Vec<String>) -> bool {
        let token = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(read) if !read.cancel.is_cancelled() => read.cancel.clone(),
                _ => return false,
            }
        };
        let mut watcher = self.watcher.lock().await;
        if let Some(previous) = watcher.take() {
            previous.stop().await;
        }
        let shared = self.shared.clone();
        let started = ArtifactWatcher::start(probe, paths, self.watch_interval, &token, move |event| {
            shared.emit(SlotEvent::Modified(event));
        })
        .await;
        *watcher = Some(started);
        true
    }

    pub async fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .await
            .as_ref()
            .map_or(false, ArtifactWatcher::is_running)
    }

    async fn stop_watching(&self) {
        let previous = self.watcher.lock().await.take();
        if let Some(watcher) = previous {
            watcher.stop().await;
        }
    }

    fn start_read(&self, stream: OutputStream, resumed: bool) -> ActiveRead {
        let OutputStream {
            process_id, body, ..
        } = stream;
        self.shared.start(&process_id, resumed);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            self.shared.clone(),
            process_id.clone(),
            body,
            cancel.clone(),
        ));
        ActiveRead {
            process_id,
            cancel,
            task,
        }
    }

    async fn hard_cancel(&self, read: ActiveRead) -> bool {
        if read.task.is_finished() {
            return false;
        }
        read.cancel.cancel();
        self.shared
            .store
            .update(&read.process_id, SessionPatch::finished());

        let backend = self.backend.clone();
        let process_id = read.process_id.clone();
        tokio::spawn(async move {
            match backend.terminate(&process_id).await {
                Ok(found) => debug!(event = "slot_terminate", process_id = %process_id, found),
                Err(err) => {
                    warn!(event = "slot_terminate_failed", process_id = %process_id, error = %err)
                }
            }
        });

        if let Err(err) = read.task.await {
            warn!(event = "slot_reader_join_failed", error = %err);
        }
        self.shared.conclude(&read.process_id, SlotState::Cancelled)
    }

    async fn detach_read(&self, read: ActiveRead) {
        read.cancel.cancel();
        if let Err(err) = read.task.await {
            warn!(event = "slot_reader_join_failed", error = %err);
        }
        let mut view = self.shared.view();
        if view.state == SlotState::Streaming
            && view.process_id.as_deref() == Some(read.process_id.as_str())
        {
            view.state = SlotState::Idle;
        }
        debug!(event = "slot_detach", process_id = %read.process_id);
    }
}

async fn pump(
    shared: Arc<Shared>,
    process_id: String,
    mut body: ByteStream,
    cancel: CancellationToken,
) {
    let mut decoder = Utf8Carry::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => shared.append(&decoder.push(&bytes)),
                Some(Err(err)) => {
                    warn!(event = "slot_stream_error", process_id = %process_id, error = %err);
                    shared.append(&decoder.finish());
                    shared.append(&format!("\nError: {err}"));
                    break;
                }
                None => {
                    shared.append(&decoder.finish());
                    break;
                }
            }
        }
    }
    shared.conclude(&process_id, SlotState::Completed);
    // Tears down watchers bound to this read.
    cancel.cancel();
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete
/// trailing sequence until the next chunk.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
