pub mod batch;
pub mod history;
pub mod models;
pub mod output_log;
pub mod process;
pub mod resolver;

pub use batch::{BatchRunner, BATCH_TIMEOUT};
pub use history::{HistoryError, HistoryStore, HISTORY_LIMIT};
pub use models::{parse_model_listing, ModelCatalog};
pub use output_log::{LogReader, OutputLog, DEFAULT_TRANSCRIPT_CAP};
pub use process::{HostConfig, InputError, ManagedProcess, ProcessHost, SpawnSpec, DEFAULT_RETENTION};
pub use resolver::SearchPath;
