use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedFile = Arc<Mutex<File>>;

/// Keeps the hub log file open for the life of the process.
pub struct LogGuard {
    _file: Option<SharedFile>,
    pub path: Option<PathBuf>,
}

/// Installs the global subscriber: stdout always, plus
/// `<log_dir>/agelum-hub-<port>.log` when a directory is configured.
/// `RUST_LOG` overrides `level`.
pub fn init(level: &str, log_dir: &str, addr: &str) -> Option<LogGuard> {
    let path = log_file_path(log_dir, addr);
    let file = match path.as_deref().map(open_append) {
        Some(Ok(file)) => Some(file),
        Some(Err(err)) => {
            eprintln!("log_file_error: {err}");
            None
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sink = file.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || TeeWriter { file: sink.clone() }))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard {
        path: file.as_ref().and(path),
        _file: file,
    })
}

fn log_file_path(log_dir: &str, addr: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return None;
    }
    let port = addr.rsplit(':').next().filter(|p| !p.is_empty()).unwrap_or("hub");
    Some(Path::new(log_dir).join(format!("agelum-hub-{}.log", sanitize_component(port))))
}

fn open_append(path: &Path) -> io::Result<SharedFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(Mutex::new(file)))
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}

/// Copies every formatted event to stdout and the optional log file.
/// Write failures are swallowed so logging never takes the hub down.
struct TeeWriter {
    file: Option<SharedFile>,
}

impl TeeWriter {
    fn with_file(&self, f: impl FnOnce(&mut File)) {
        if let Some(file) = &self.file {
            let mut guard = match file.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut guard);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().lock().write_all(buf);
        self.with_file(|file| {
            let _ = file.write_all(buf);
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().lock().flush();
        self.with_file(|file| {
            let _ = file.flush();
        });
        Ok(())
    }
}
