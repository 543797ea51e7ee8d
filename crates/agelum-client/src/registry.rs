use crate::ClientError;
use agelum_core::{Session, SessionPatch};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const SESSIONS_FILE: &str = "sessions.json";

/// Context key to most recent session. Constructed once by the application and
/// shared by reference; it performs no I/O except the explicit snapshot
/// helpers.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".agelum").join(SESSIONS_FILE))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers `session` for its context key and returns the entry it
    /// replaced. The replaced session is not terminated.
    pub fn register(&self, session: Session) -> Option<Session> {
        debug!(
            event = "session_register",
            context_key = %session.context_key,
            process_id = %session.process_id
        );
        self.lock().insert(session.context_key.clone(), session)
    }

    pub fn get(&self, context_key: &str) -> Option<Session> {
        self.lock().get(context_key).cloned()
    }

    /// Applies a patch to the entry holding `process_id`. Patches for a
    /// process that was replaced in its slot find nothing and are dropped.
    pub fn update(&self, process_id: &str, patch: SessionPatch) -> bool {
        let mut sessions = self.lock();
        match sessions
            .values_mut()
            .find(|session| session.process_id == process_id)
        {
            Some(session) => session.apply(&patch),
            None => false,
        }
    }

    pub fn remove(&self, process_id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        let key = sessions
            .iter()
            .find(|(_, session)| session.process_id == process_id)
            .map(|(key, _)| key.clone())?;
        debug!(event = "session_remove", context_key = %key, process_id);
        sessions.remove(&key)
    }

    /// All entries ordered by start time, then context key.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.context_key.cmp(&b.context_key))
        });
        sessions
    }

    pub fn restore(sessions: Vec<Session>) -> Self {
        let store = Self::new();
        for session in sessions {
            store.register(session);
        }
        store
    }

    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Missing file loads as an empty store.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(Self::restore(serde_json::from_str(&raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, key: &str) -> Session {
        Session::new(id, "claude", key, "prompt")
    }

    #[test]
    fn registering_other_keys_leaves_existing_entries_untouched() {
        let store = SessionStore::new();
        let first = session("p1", "A");
        store.register(first.clone());
        store.register(session("p2", "B"));
        assert_eq!(store.get("A"), Some(first));
        assert_eq!(store.get("B").unwrap().process_id, "p2");
    }

    #[test]
    fn registering_same_key_replaces_entry() {
        let store = SessionStore::new();
        store.register(session("p1", "A"));
        let replaced = store.register(session("p2", "A"));
        assert_eq!(replaced.unwrap().process_id, "p1");
        assert_eq!(store.get("A").unwrap().process_id, "p2");
    }

    #[test]
    fn stale_updates_cannot_clobber_newer_session() {
        let store = SessionStore::new();
        store.register(session("old", "A"));
        store.register(session("new", "A"));
        assert!(!store.update("old", SessionPatch::finished()));
        assert!(store.remove("old").is_none());
        assert!(store.get("A").unwrap().is_running);

        assert!(store.update("new", SessionPatch::finished()));
        assert!(!store.get("A").unwrap().is_running);
        assert_eq!(store.remove("new").unwrap().process_id, "new");
        assert!(store.get("A").is_none());
    }

    #[test]
    fn snapshot_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(SESSIONS_FILE);
        let store = SessionStore::new();
        store.register(session("p1", "A"));
        store.register(session("p2", "B"));
        store.save(&path).unwrap();

        let loaded = SessionStore::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), store.snapshot());
        assert!(SessionStore::load(&dir.path().join("missing.json"))
            .unwrap()
            .snapshot()
            .is_empty());
    }
}
