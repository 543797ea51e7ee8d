use crate::HubState;
use agelum_core::session::{new_process_id, now_ms};
use agelum_core::wire::{
    Ack, ErrorResponse, HistoryAppend, HistoryAppendResponse, HistoryResponse, InputRequest,
    LaunchRequest, ModelsResponse, MtimeResponse, RunRequest, StreamKind, ToolAvailability,
    ToolsResponse, PROCESS_ID_HEADER, PROCESS_RUNNING_HEADER, STREAM_KIND_HEADER,
};
use agelum_core::{compile, AgentError, CompileRequest, HistoryEntry, ToolDefinition, ToolKind};
use agelum_runner::{InputError, LogReader, SpawnSpec};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

type Hub = State<Arc<HubState>>;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn lookup_tool<'a>(hub: &'a HubState, name: &str) -> Result<&'a ToolDefinition, Response> {
    hub.catalog
        .get(name)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, format!("Unknown tool: {name}")))
}

fn validate_run(request: &RunRequest) -> Result<(), Response> {
    if request.tool.trim().is_empty() || request.prompt.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Tool and prompt are required",
        ));
    }
    Ok(())
}

fn is_available(hub: &HubState, tool: &ToolDefinition) -> bool {
    match &tool.kind {
        ToolKind::Web { .. } => true,
        ToolKind::Cli | ToolKind::App => hub.search.is_available(&tool.command),
    }
}

pub async fn list_tools(State(hub): Hub) -> Json<ToolsResponse> {
    let tools = hub
        .catalog
        .iter()
        .map(|tool| ToolAvailability {
            name: tool.name.clone(),
            display_name: tool.display_name.clone(),
            kind: tool.kind.as_str().to_string(),
            available: is_available(&hub, tool),
        })
        .collect();
    Json(ToolsResponse { tools })
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    tool: Option<String>,
}

pub async fn list_models(State(hub): Hub, Query(query): Query<ModelsQuery>) -> Response {
    let Some(name) = query.tool.filter(|tool| !tool.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "tool is required");
    };
    if let Err(response) = lookup_tool(&hub, &name) {
        return response;
    }
    let models = hub.models.get_models(&name).await;
    Json(ModelsResponse { models }).into_response()
}

pub async fn run_batch(State(hub): Hub, Json(request): Json<RunRequest>) -> Response {
    if let Err(response) = validate_run(&request) {
        return response;
    }
    let tool = match lookup_tool(&hub, &request.tool) {
        Ok(tool) => tool,
        Err(response) => return response,
    };
    let settings = hub.settings();
    let compile_request = CompileRequest {
        tool,
        prompt: &request.prompt,
        model: request.model.as_deref(),
        allow_modify: request.allow_modify,
        settings: settings.tool(&tool.name),
        workflow: request.workflow.as_deref(),
    };
    let cwd = request.cwd.as_deref().map(PathBuf::from);
    let result = hub.batch.run(&compile_request, cwd.as_deref()).await;
    info!(event = "batch_done", tool = %tool.name, success = result.success);
    Json(result).into_response()
}

pub async fn launch(State(hub): Hub, Json(request): Json<LaunchRequest>) -> Response {
    if let Err(response) = validate_run(&request.run) {
        return response;
    }
    let tool = match lookup_tool(&hub, &request.run.tool) {
        Ok(tool) => tool,
        Err(response) => return response,
    };
    let settings = hub.settings();
    let compile_request = CompileRequest {
        tool,
        prompt: &request.run.prompt,
        model: request.run.model.as_deref(),
        allow_modify: request.run.allow_modify,
        settings: settings.tool(&tool.name),
        workflow: request.run.workflow.as_deref(),
    };
    let compiled = match compile(&compile_request) {
        Ok(compiled) => compiled,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    if !hub.search.is_available(&compiled.command) {
        return error_response(
            StatusCode::BAD_REQUEST,
            AgentError::ToolUnavailable(tool.name.clone()).to_string(),
        );
    }

    let (cols, rows) = request.size();
    let spec = SpawnSpec {
        tool_name: tool.name.clone(),
        program: hub.search.resolve_path(&compiled.command),
        args: compiled.args,
        cwd: request.run.cwd.as_deref().map(PathBuf::from),
        cols,
        rows,
        path_env: Some(hub.search.to_env_value()),
    };
    let process = hub.host.spawn(spec).await;
    info!(event = "session_launch", process_id = %process.id, tool = %tool.name);
    stream_response(
        &process.id,
        process.is_alive(),
        StreamKind::Launch,
        process.reader(0),
    )
}

pub async fn relay_input(State(hub): Hub, Json(request): Json<InputRequest>) -> Response {
    match hub.host.write_input(&request.id, request.data.as_bytes()).await {
        Ok(()) => Json(Ack { success: true }).into_response(),
        Err(err @ (InputError::UnknownProcess(_) | InputError::NotRunning(_))) => {
            debug!(event = "input_rejected", process_id = %request.id, error = %err);
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        Err(err) => {
            warn!(event = "input_failed", process_id = %request.id, error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

pub async fn session_status(State(hub): Hub, Path(id): Path<String>) -> Response {
    match hub.host.status(&id).await {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Unknown process: {id}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    from: Option<u64>,
}

pub async fn resume_stream(
    State(hub): Hub,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some(process) = hub.host.get(&id).await else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown process: {id}"));
    };
    let from = query.from.unwrap_or(0);
    debug!(event = "session_resume", process_id = %id, from);
    stream_response(
        &process.id,
        process.is_alive(),
        StreamKind::Resume,
        process.reader(from),
    )
}

pub async fn terminate_session(State(hub): Hub, Path(id): Path<String>) -> Json<Ack> {
    let success = hub.host.terminate(&id).await;
    info!(event = "session_terminate", process_id = %id, known = success);
    Json(Ack { success })
}

pub async fn read_history(State(hub): Hub) -> Response {
    let store = hub.history.clone();
    match tokio::task::spawn_blocking(move || store.read()).await {
        Ok(history) => Json(HistoryResponse { history }).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn append_history(State(hub): Hub, Json(body): Json<HistoryAppend>) -> Response {
    if body.tool_name.is_empty() || body.prompt.is_empty() || body.context_key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing required fields: toolName, prompt, contextKey",
        );
    }
    let entry = HistoryEntry {
        process_id: body
            .process_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_process_id),
        tool_name: body.tool_name,
        context_key: body.context_key,
        started_at: body.started_at.filter(|at| *at > 0).unwrap_or_else(now_ms),
        prompt: body.prompt,
        project_name: body.project_name,
        file_path: body.file_path,
    };
    let store = hub.history.clone();
    let stored = entry.clone();
    match tokio::task::spawn_blocking(move || store.append(stored)).await {
        Ok(Ok(())) => Json(HistoryAppendResponse { session: entry }).into_response(),
        Ok(Err(err)) => {
            warn!(event = "history_append_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save history")
        }
        Err(err) => {
            warn!(event = "history_append_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save history")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MtimeQuery {
    path: Option<String>,
}

pub async fn file_mtime(Query(query): Query<MtimeQuery>) -> Response {
    let Some(path) = query.path.filter(|path| !path.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "path is required");
    };
    let mtime_ms = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as i64),
        Err(_) => None,
    };
    Json(MtimeResponse { path, mtime_ms }).into_response()
}

fn stream_response(id: &str, running: bool, kind: StreamKind, reader: LogReader) -> Response {
    let body = Body::from_stream(
        reader
            .into_stream()
            .map(Ok::<Vec<u8>, std::convert::Infallible>),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(PROCESS_ID_HEADER, id)
        .header(PROCESS_RUNNING_HEADER, if running { "true" } else { "false" })
        .header(STREAM_KIND_HEADER, kind.as_str())
        .body(body)
        .unwrap_or_else(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}
