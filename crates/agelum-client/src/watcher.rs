use crate::backend::Backend;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Source of modification times. `None` means the path is missing or could
/// not be read this tick.
#[async_trait]
pub trait MtimeProbe: Send + Sync {
    async fn mtime(&self, path: &str) -> Option<i64>;
}

/// Reads mtimes from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMtimeProbe;

#[async_trait]
impl MtimeProbe for FsMtimeProbe {
    async fn mtime(&self, path: &str) -> Option<i64> {
        let metadata = tokio::fs::metadata(Path::new(path)).await.ok()?;
        let modified = metadata.modified().ok()?;
        let elapsed = modified.duration_since(UNIX_EPOCH).ok()?;
        i64::try_from(elapsed.as_millis()).ok()
    }
}

/// Asks the hub, for paths that live on the machine running the tools.
#[derive(Clone)]
pub struct BackendMtimeProbe {
    backend: Arc<dyn Backend>,
}

impl BackendMtimeProbe {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl MtimeProbe for BackendMtimeProbe {
    async fn mtime(&self, path: &str) -> Option<i64> {
        match self.backend.file_mtime(path).await {
            Ok(mtime) => mtime,
            Err(err) => {
                debug!(event = "mtime_probe_failed", path, error = %err);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub mtime_ms: i64,
}

/// Polls a fixed set of paths and reports external modifications.
///
/// The last-known map is seeded before the first tick and lives only inside
/// the polling task, so stopping the watcher drops it.
pub struct ArtifactWatcher {
    paths: Vec<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ArtifactWatcher {
    /// Seeds mtimes, then polls every `interval` until `parent` or
    /// [`ArtifactWatcher::stop`] cancels it.
    pub async fn start<F>(
        probe: Arc<dyn MtimeProbe>,
        paths: Vec<String>,
        interval: Duration,
        parent: &CancellationToken,
        sink: F,
    ) -> Self
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let mut known = HashMap::new();
        for path in &paths {
            if let Some(mtime) = probe.mtime(path).await {
                known.insert(path.clone(), mtime);
            }
        }
        let cancel = parent.child_token();
        let task = tokio::spawn(poll_loop(
            probe,
            paths.clone(),
            known,
            interval.max(Duration::from_millis(10)),
            cancel.clone(),
            sink,
        ));
        debug!(event = "watch_start", paths = paths.len());
        Self {
            paths,
            cancel,
            task,
        }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(event = "watch_join_failed", error = %err);
        }
    }
}

async fn poll_loop<F>(
    probe: Arc<dyn MtimeProbe>,
    paths: Vec<String>,
    mut known: HashMap<String, i64>,
    interval: Duration,
    cancel: CancellationToken,
    sink: F,
) where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for path in &paths {
                    let Some(mtime) = probe.mtime(path).await else {
                        continue;
                    };
                    // A path missing at seed time that shows up later counts as modified.
                    if known.insert(path.clone(), mtime) != Some(mtime) {
                        debug!(event = "artifact_modified", path = %path, mtime_ms = mtime);
                        sink(WatchEvent {
                            path: path.clone(),
                            mtime_ms: mtime,
                        });
                    }
                }
            }
        }
    }
    debug!(event = "watch_stop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;
    use tokio::sync::mpsc;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn reports_changes_after_seed_and_skips_missing_files() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("plan.md", Some(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let parent = CancellationToken::new();
        let watcher = ArtifactWatcher::start(
            probe.clone(),
            vec!["plan.md".to_string(), "summary.md".to_string()],
            Duration::from_millis(20),
            &parent,
            move |event| {
                let _ = tx.send(event);
            },
        )
        .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "seeded mtime is not a change");

        probe.set("plan.md", None);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "missing file is skipped");

        probe.set("plan.md", Some(2));
        assert_eq!(
            next_event(&mut rx).await,
            WatchEvent {
                path: "plan.md".to_string(),
                mtime_ms: 2
            }
        );

        probe.set("summary.md", Some(7));
        assert_eq!(next_event(&mut rx).await.path, "summary.md");

        watcher.stop().await;
    }

    #[tokio::test]
    async fn parent_cancellation_tears_down_the_loop() {
        let probe = Arc::new(ScriptedProbe::default());
        let parent = CancellationToken::new();
        let watcher = ArtifactWatcher::start(
            probe,
            vec!["a.md".to_string()],
            Duration::from_millis(20),
            &parent,
            |_| {},
        )
        .await;
        assert!(watcher.is_running());
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while watcher.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watcher stops with its parent");
    }

    #[tokio::test]
    async fn fs_probe_reads_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "x").unwrap();
        let probe = FsMtimeProbe;
        assert!(probe.mtime(&file.to_string_lossy()).await.is_some());
        assert!(probe
            .mtime(&dir.path().join("gone.md").to_string_lossy())
            .await
            .is_none());
    }
}
