use thiserror::Error;

pub mod backend;
pub mod reconnect;
pub mod registry;
pub mod slot;
#[cfg(test)]
mod testing;
pub mod watcher;

pub use backend::{Backend, ByteStream, HttpBackend, OutputStream};
pub use reconnect::{reconnect, ReconnectOutcome};
pub use registry::SessionStore;
pub use slot::{LaunchOptions, SlotController, SlotEvent, SlotState};
pub use watcher::{
    ArtifactWatcher, BackendMtimeProbe, FsMtimeProbe, MtimeProbe, WatchEvent,
    DEFAULT_WATCH_INTERVAL,
};

pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:4317";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("missing response header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}
