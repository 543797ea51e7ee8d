use agelum_core::session::now_ms;
use agelum_core::HistoryEntry;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const HISTORY_LIMIT: usize = 100;
pub const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct HistoryLock {
    file: File,
}

impl HistoryLock {
    fn acquire(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Durable launch log: newest entry first, bounded length, owner-only
/// permissions.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            limit: HISTORY_LIMIT,
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".agelum").join(HISTORY_FILE))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Unreadable or corrupt history reads as empty.
    pub fn read(&self) -> Vec<HistoryEntry> {
        match self.try_read() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(event = "history_read_failed", path = %self.path.display(), error = %err);
                Vec::new()
            }
        }
    }

    fn try_read(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let _lock = HistoryLock::acquire(&self.lock_path())?;
        let mut entries = match self.try_read() {
            Ok(entries) => entries,
            Err(HistoryError::Serialize(err)) => {
                let aside = self.set_aside()?;
                warn!(
                    event = "history_corrupt",
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %err
                );
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        entries.insert(0, entry);
        entries.truncate(self.limit);
        self.write(&entries)
    }

    /// Keeps an unparseable log next to the fresh one instead of overwriting it.
    fn set_aside(&self) -> Result<PathBuf, HistoryError> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", now_ms()));
        let aside = PathBuf::from(name);
        fs::rename(&self.path, &aside)?;
        Ok(aside)
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        let encoded = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            process_id: id.to_string(),
            tool_name: "claude".to_string(),
            context_key: "docs/plan.md".to_string(),
            started_at: 1_700_000_000_000,
            prompt: "write the plan".to_string(),
            project_name: Some("agelum".to_string()),
            file_path: None,
        }
    }

    #[test]
    fn append_keeps_newest_first_and_trims() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("nested").join("history.json")).with_limit(3);
        for id in ["a", "b", "c", "d"] {
            store.append(entry(id)).unwrap();
        }
        let ids: Vec<String> = store.read().into_iter().map(|e| e.process_id).collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
    }

    #[test]
    fn missing_or_corrupt_file_reads_empty() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        assert!(store.read().is_empty());
        fs::write(store.path(), "[{").unwrap();
        assert!(store.read().is_empty());
    }

    #[test]
    fn append_sets_corrupt_log_aside_instead_of_overwriting_it() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        fs::write(store.path(), "[{\"processId\": \"half-writ").unwrap();

        store.append(entry("fresh")).unwrap();
        let ids: Vec<String> = store.read().into_iter().map(|e| e.process_id).collect();
        assert_eq!(ids, vec!["fresh"]);

        let kept: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("history.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        let raw = fs::read_to_string(dir.path().join(&kept[0])).unwrap();
        assert_eq!(raw, "[{\"processId\": \"half-writ");
    }

    #[test]
    fn append_propagates_read_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::create_dir(&path).unwrap();
        let store = HistoryStore::new(path.clone());

        assert!(matches!(
            store.append(entry("a")),
            Err(HistoryError::Io(_))
        ));
        assert!(path.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn history_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        store.append(entry("a")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
