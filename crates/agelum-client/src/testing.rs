//! In-memory [`Backend`] for client tests.

use crate::backend::{Backend, OutputStream};
use crate::watcher::MtimeProbe;
use crate::ClientError;
use agelum_core::wire::{
    LaunchRequest, RunRequest, RunResponse, SessionStatus, StreamKind, ToolAvailability,
};
use agelum_core::HistoryEntry;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

enum ScriptedLaunch {
    Stream {
        process_id: String,
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    },
    Fail(String),
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    alive: HashMap<String, bool>,
    resume: HashMap<String, Vec<Vec<u8>>>,
    launches: VecDeque<ScriptedLaunch>,
    history: Vec<HistoryEntry>,
    inputs: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

fn not_found(what: &str) -> ClientError {
    ClientError::Status {
        status: 404,
        message: format!("unknown {what}"),
    }
}

impl MockBackend {
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.with(|state| state.history.clone())
    }

    pub fn inputs(&self) -> Vec<(String, String)> {
        self.with(|state| state.inputs.clone())
    }

    pub fn set_alive(&self, process_id: &str, alive: bool) {
        self.with(|state| state.alive.insert(process_id.to_string(), alive));
    }

    pub fn set_resume_chunks(&self, process_id: &str, chunks: &[&str]) {
        let chunks = chunks.iter().map(|chunk| chunk.as_bytes().to_vec()).collect();
        self.with(|state| state.resume.insert(process_id.to_string(), chunks));
    }

    /// Queues a launch whose body yields whatever is sent on the returned
    /// channel and ends when it is dropped.
    pub fn queue_launch(&self, process_id: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with(|state| {
            state.launches.push_back(ScriptedLaunch::Stream {
                process_id: process_id.to_string(),
                chunks: rx,
            })
        });
        tx
    }

    pub fn queue_launch_error(&self, message: &str) {
        self.with(|state| {
            state
                .launches
                .push_back(ScriptedLaunch::Fail(message.to_string()))
        });
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn list_tools(&self) -> Result<Vec<ToolAvailability>, ClientError> {
        Ok(Vec::new())
    }

    async fn list_models(&self, _tool: &str) -> Result<Vec<String>, ClientError> {
        Ok(Vec::new())
    }

    async fn run(&self, request: &RunRequest) -> Result<RunResponse, ClientError> {
        self.with(|state| state.calls.push(format!("run:{}", request.tool)));
        Ok(RunResponse {
            success: true,
            output: String::new(),
            error: None,
        })
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<OutputStream, ClientError> {
        let next = self.with(|state| {
            state.calls.push(format!("launch:{}", request.run.tool));
            state.launches.pop_front()
        });
        match next {
            Some(ScriptedLaunch::Stream { process_id, chunks }) => {
                self.set_alive(&process_id, true);
                let body = stream::unfold(chunks, |mut chunks| async move {
                    chunks.recv().await.map(|chunk| (Ok(chunk), chunks))
                })
                .boxed();
                Ok(OutputStream {
                    process_id,
                    kind: StreamKind::Launch,
                    running: true,
                    body,
                })
            }
            Some(ScriptedLaunch::Fail(message)) => Err(ClientError::Status {
                status: 400,
                message,
            }),
            None => Err(not_found("launch")),
        }
    }

    async fn send_input(&self, process_id: &str, data: &str) -> Result<(), ClientError> {
        self.with(|state| {
            state.calls.push(format!("input:{process_id}"));
            state.inputs.push((process_id.to_string(), data.to_string()));
        });
        Ok(())
    }

    async fn status(&self, process_id: &str) -> Result<SessionStatus, ClientError> {
        let alive = self.with(|state| {
            state.calls.push(format!("status:{process_id}"));
            state.alive.get(process_id).copied()
        });
        let alive = alive.ok_or_else(|| not_found("process"))?;
        Ok(SessionStatus {
            alive,
            exit_code: None,
            tool_name: "claude".to_string(),
            started_at: 0,
            transcript_bytes: 0,
        })
    }

    async fn resume(
        &self,
        process_id: &str,
        _from: Option<u64>,
    ) -> Result<OutputStream, ClientError> {
        let chunks = self.with(|state| {
            state.calls.push(format!("resume:{process_id}"));
            state.resume.get(process_id).cloned()
        });
        let chunks = chunks.ok_or_else(|| not_found("process"))?;
        Ok(OutputStream {
            process_id: process_id.to_string(),
            kind: StreamKind::Resume,
            running: true,
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }

    async fn terminate(&self, process_id: &str) -> Result<bool, ClientError> {
        let known = self.with(|state| {
            state.calls.push(format!("terminate:{process_id}"));
            state.alive.insert(process_id.to_string(), false).is_some()
        });
        Ok(known)
    }

    async fn history(&self) -> Result<Vec<HistoryEntry>, ClientError> {
        Ok(MockBackend::history(self))
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), ClientError> {
        self.with(|state| {
            state.calls.push(format!("history:{}", entry.process_id));
            state.history.insert(0, entry.clone());
        });
        Ok(())
    }

    async fn file_mtime(&self, _path: &str) -> Result<Option<i64>, ClientError> {
        Ok(None)
    }
}

/// Mtime source whose values tests set directly.
#[derive(Default)]
pub struct ScriptedProbe {
    mtimes: Mutex<HashMap<String, i64>>,
}

impl ScriptedProbe {
    pub fn set(&self, path: &str, mtime: Option<i64>) {
        let mut mtimes = self.mtimes.lock().unwrap();
        match mtime {
            Some(value) => mtimes.insert(path.to_string(), value),
            None => mtimes.remove(path),
        };
    }
}

#[async_trait]
impl MtimeProbe for ScriptedProbe {
    async fn mtime(&self, path: &str) -> Option<i64> {
        self.mtimes.lock().unwrap().get(path).copied()
    }
}
