use agelum_core::{SettingsFile, ToolCatalog};
use agelum_runner::{BatchRunner, HistoryStore, HostConfig, ModelCatalog, ProcessHost, SearchPath};
use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod api;

/// Construction inputs for [`HubState`].
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub catalog: ToolCatalog,
    pub search: SearchPath,
    pub host: HostConfig,
    pub settings_path: Option<PathBuf>,
    pub history_path: PathBuf,
}

pub struct HubState {
    pub catalog: Arc<ToolCatalog>,
    pub search: SearchPath,
    pub models: ModelCatalog,
    pub batch: BatchRunner,
    pub host: Arc<ProcessHost>,
    pub history: HistoryStore,
    settings_path: Option<PathBuf>,
}

impl HubState {
    pub fn new(options: HubOptions) -> Self {
        let catalog = Arc::new(options.catalog);
        Self {
            models: ModelCatalog::new(catalog.clone(), options.search.clone()),
            batch: BatchRunner::new(options.search.clone()),
            host: Arc::new(ProcessHost::new(options.host)),
            history: HistoryStore::new(options.history_path),
            settings_path: options.settings_path,
            search: options.search,
            catalog,
        }
    }

    /// Settings are re-read per request so edits apply without a restart.
    pub fn settings(&self) -> SettingsFile {
        match &self.settings_path {
            Some(path) => SettingsFile::load(path),
            None => SettingsFile::default(),
        }
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/agents/tools", get(api::list_tools))
        .route("/agents/models", get(api::list_models))
        .route("/agents/run", post(api::run_batch))
        .route("/agents/launch", post(api::launch))
        .route("/agents/input", post(api::relay_input))
        .route(
            "/agents/sessions/:id",
            axum::routing::delete(api::terminate_session),
        )
        .route("/agents/sessions/:id/status", get(api::session_status))
        .route("/agents/sessions/:id/stream", get(api::resume_stream))
        .route(
            "/agents/history",
            get(api::read_history).post(api::append_history),
        )
        .route("/files/mtime", get(api::file_mtime))
        .layer(middleware::from_fn(loopback_only))
        .with_state(hub)
}

async fn loopback_only(request: Request, next: Next) -> Response {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        if !addr.ip().is_loopback() {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

/// Serves the hub until `shutdown` resolves, then terminates every live
/// process.
pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = hub.host.start_reaper();
    let app = router(hub.clone());
    // Live transcripts keep connections open; ending the processes lets
    // graceful shutdown complete.
    let host = hub.host.clone();
    let shutdown = async move {
        shutdown.await;
        host.terminate_all().await;
    };
    if let Ok(addr) = listener.local_addr() {
        info!(event = "hub_start", addr = %addr);
    }
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    if let Err(err) = &result {
        error!(event = "hub_error", error = %err);
    }
    reaper.abort();
    hub.host.terminate_all().await;
    info!(event = "hub_stop");
    result
}
