use crate::backend::{Backend, OutputStream};
use crate::registry::SessionStore;
use tracing::{debug, info, warn};

pub enum ReconnectOutcome {
    /// Nothing to resume for this context key.
    Idle,
    /// The entry pointed at a dead or unreachable process and was removed.
    Purged { process_id: String },
    /// Full transcript followed by live output.
    Resumed(OutputStream),
}

impl ReconnectOutcome {
    pub fn is_resumed(&self) -> bool {
        matches!(self, ReconnectOutcome::Resumed(_))
    }
}

/// Looks up `context_key`, probes liveness and opens a resume stream.
///
/// Never fails: every error path purges the registry entry and reports an
/// idle slot. The resumed stream replays from offset zero, so callers drop
/// any local output before appending from it.
pub async fn reconnect(
    backend: &dyn Backend,
    store: &SessionStore,
    context_key: &str,
) -> ReconnectOutcome {
    let Some(session) = store.get(context_key) else {
        return ReconnectOutcome::Idle;
    };
    if !session.is_running {
        return ReconnectOutcome::Idle;
    }
    let process_id = session.process_id;

    match backend.status(&process_id).await {
        Ok(status) if status.alive => {}
        Ok(_) => {
            debug!(event = "reconnect_dead", context_key, process_id = %process_id);
            store.remove(&process_id);
            return ReconnectOutcome::Purged { process_id };
        }
        Err(err) => {
            warn!(event = "reconnect_probe_failed", context_key, process_id = %process_id, error = %err);
            store.remove(&process_id);
            return ReconnectOutcome::Purged { process_id };
        }
    }

    match backend.resume(&process_id, None).await {
        Ok(stream) => {
            info!(event = "reconnect_resumed", context_key, process_id = %process_id);
            ReconnectOutcome::Resumed(stream)
        }
        Err(err) => {
            warn!(event = "reconnect_resume_failed", context_key, process_id = %process_id, error = %err);
            store.remove(&process_id);
            ReconnectOutcome::Purged { process_id }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use agelum_core::{Session, SessionPatch};
    use futures_util::StreamExt;

    #[tokio::test]
    async fn missing_or_finished_entries_stay_idle_without_probing() {
        let backend = MockBackend::default();
        let store = SessionStore::new();
        assert!(matches!(
            reconnect(&backend, &store, "A").await,
            ReconnectOutcome::Idle
        ));

        store.register(Session::new("p1", "claude", "A", "x"));
        store.update("p1", SessionPatch::finished());
        assert!(matches!(
            reconnect(&backend, &store, "A").await,
            ReconnectOutcome::Idle
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn dead_process_is_purged() {
        let backend = MockBackend::default();
        backend.set_alive("p1", false);
        let store = SessionStore::new();
        store.register(Session::new("p1", "claude", "A", "x"));

        let outcome = reconnect(&backend, &store, "A").await;
        assert!(matches!(outcome, ReconnectOutcome::Purged { ref process_id } if process_id == "p1"));
        assert!(store.get("A").is_none());
        assert_eq!(backend.calls(), vec!["status:p1"]);
    }

    #[tokio::test]
    async fn probe_failure_is_purged_not_raised() {
        let backend = MockBackend::default();
        let store = SessionStore::new();
        store.register(Session::new("unknown", "claude", "A", "x"));

        assert!(!reconnect(&backend, &store, "A").await.is_resumed());
        assert!(store.get("A").is_none());
    }

    #[tokio::test]
    async fn live_process_resumes_with_full_transcript() {
        let backend = MockBackend::default();
        backend.set_alive("p1", true);
        backend.set_resume_chunks("p1", &["hello ", "again"]);
        let store = SessionStore::new();
        store.register(Session::new("p1", "claude", "A", "x"));

        let ReconnectOutcome::Resumed(stream) = reconnect(&backend, &store, "A").await else {
            panic!("expected resume");
        };
        assert_eq!(stream.process_id, "p1");
        let chunks: Vec<Vec<u8>> = stream.body.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"hello again");
        assert!(store.get("A").unwrap().is_running);
        assert_eq!(backend.calls(), vec!["status:p1", "resume:p1"]);
    }
}
