//! HTTP handlers for the `/api/v1` surface. Each handler does argument parsing/validation and
//! delegates the actual work to `arm2_session::Service` or `SessionManager`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use arm2_core::memory::CODE_BASE;
use arm2_debug::{WatchKind, WatchTarget};
use arm2_session::Service;

use crate::error::ApiError;
use crate::state::AppState;

fn parse_addr(s: &str) -> Result<u32, ApiError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|_| ApiError::BadRequest(format!("invalid address: {s}")))
    } else {
        s.parse::<u32>().map_err(|_| ApiError::BadRequest(format!("invalid address: {s}")))
    }
}

fn find_session(state: &AppState, id: &str) -> Result<Arc<Service>, ApiError> {
    state.sessions.get(id).ok_or_else(|| ApiError::NotFound(format!("no session with id {id}")))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn create_session(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let service = state.sessions.create().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "sessionId": service.session_id(),
        "createdAt": chrono::Utc::now().to_rfc3339(),
    })))
}

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.sessions.list() }))
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let snapshot = service.register_state();
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "status": snapshot.status,
        "pc": snapshot.pc,
        "cycles": snapshot.cycles,
        "hasWrite": service.last_memory_write().is_some(),
    })))
}

pub async fn destroy_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    if state.sessions.destroy(&id) {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no session with id {id}")))
    }
}

#[derive(Deserialize)]
pub struct LoadBody {
    source: String,
    origin: Option<String>,
}

pub async fn load_program(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LoadBody>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let origin = body.origin.as_deref().map(parse_addr).transpose()?.unwrap_or(CODE_BASE);
    let symbols = service.assemble_and_load(&body.source, origin)?;
    Ok(Json(serde_json::json!({ "symbols": symbols })))
}

pub async fn run_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    if service.is_running() {
        return Err(ApiError::BadRequest("a run is already in progress for this session".to_string()));
    }
    service.set_running(true);
    let svc = service.clone();
    tokio::task::spawn_blocking(move || {
        svc.run_until_halt();
    });
    Ok(Json(serde_json::json!({ "status": "running" })))
}

pub async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    service.request_pause();
    Ok(Json(serde_json::json!({ "status": "pausing" })))
}

pub async fn step(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let svc = service.clone();
    let reason = tokio::task::spawn_blocking(move || svc.step()).await.map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(serde_json::json!({ "reason": format!("{reason:?}"), "state": service.register_state() })))
}

pub async fn step_over(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let svc = service.clone();
    let reason = tokio::task::spawn_blocking(move || svc.step_over()).await.map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(serde_json::json!({ "reason": format!("{reason:?}"), "state": service.register_state() })))
}

pub async fn step_out(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let svc = service.clone();
    let reason = tokio::task::spawn_blocking(move || svc.step_out()).await.map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(serde_json::json!({ "reason": format!("{reason:?}"), "state": service.register_state() })))
}

pub async fn reset_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    service.reset()?;
    Ok(Json(serde_json::json!({ "status": "reset" })))
}

pub async fn registers(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    Ok(Json(service.register_state()))
}

#[derive(Deserialize)]
pub struct MemoryQuery {
    address: String,
    length: u32,
}

const MAX_MEMORY_READ: u32 = 1 << 20;

pub async fn memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MemoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let address = parse_addr(&query.address)?;
    let length = query.length.min(MAX_MEMORY_READ);
    let bytes = service.read_memory(address, length)?;
    Ok(Json(serde_json::json!({ "address": address, "bytes": bytes })))
}

#[derive(Deserialize)]
pub struct DisassemblyQuery {
    address: String,
    count: u32,
}

const MAX_DISASSEMBLY_COUNT: u32 = 1000;

pub async fn disassembly(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DisassemblyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let address = parse_addr(&query.address)?;
    let count = query.count.min(MAX_DISASSEMBLY_COUNT);
    Ok(Json(serde_json::json!({ "instructions": service.disassembly(address, count) })))
}

#[derive(Deserialize)]
pub struct BreakpointBody {
    address: String,
    temporary: Option<bool>,
    condition: Option<String>,
}

pub async fn add_breakpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BreakpointBody>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let address = parse_addr(&body.address)?;
    let bp = service.add_breakpoint(address, body.temporary.unwrap_or(false), body.condition)?;
    Ok(Json(bp))
}

#[derive(Deserialize)]
pub struct BreakpointDeleteQuery {
    id: u64,
}

pub async fn remove_breakpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BreakpointDeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    if service.remove_breakpoint(query.id)? {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no breakpoint with id {}", query.id)))
    }
}

pub async fn list_breakpoints(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    Ok(Json(service.breakpoints()))
}

#[derive(Deserialize)]
pub struct WatchpointBody {
    address: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn parse_watch_kind(text: Option<&str>) -> Result<WatchKind, ApiError> {
    match text.unwrap_or("readwrite") {
        "read" => Ok(WatchKind::Read),
        "write" => Ok(WatchKind::Write),
        "readwrite" => Ok(WatchKind::ReadWrite),
        other => Err(ApiError::BadRequest(format!("unknown watchpoint type: {other}"))),
    }
}

pub async fn add_watchpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WatchpointBody>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let address = parse_addr(&body.address)?;
    let kind = parse_watch_kind(body.kind.as_deref())?;
    let wp = service.add_watchpoint(kind, WatchTarget::Memory(address))?;
    Ok(Json(wp))
}

pub async fn remove_watchpoint(
    State(state): State<AppState>,
    Path((id, watchpoint_id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    if service.remove_watchpoint(watchpoint_id)? {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no watchpoint with id {watchpoint_id}")))
    }
}

pub async fn list_watchpoints(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    Ok(Json(service.watchpoints()))
}

pub async fn trace_toggle(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    match action.as_str() {
        "enable" => service.enable_trace(true),
        "disable" => service.enable_trace(false),
        other => return Err(ApiError::BadRequest(format!("unknown trace action: {other}"))),
    }
    Ok(Json(serde_json::json!({ "status": action })))
}

pub async fn trace_data(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let entries: Vec<_> = service.trace_data().into_iter().map(trace_entry_to_json).collect();
    Ok(Json(serde_json::json!({ "entries": entries })))
}

fn trace_entry_to_json(entry: arm2_core::trace::TraceEntry) -> serde_json::Value {
    serde_json::json!({
        "sequence": entry.sequence,
        "address": entry.address,
        "opcode": entry.opcode,
        "disasm": entry.disasm,
        "registerChanges": entry.register_changes,
    })
}

pub async fn stats_toggle(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    match action.as_str() {
        "enable" => service.enable_stats(true),
        "disable" => service.enable_stats(false),
        other => return Err(ApiError::BadRequest(format!("unknown stats action: {other}"))),
    }
    Ok(Json(serde_json::json!({ "status": action })))
}

pub async fn stats(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    service
        .stats_snapshot()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("statistics are not enabled for this session".to_string()))
}

#[derive(Deserialize)]
pub struct StdinBody {
    data: String,
}

pub async fn send_stdin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StdinBody>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    service.send_input(&body.data);
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct EvaluateBody {
    expr: String,
}

#[derive(Serialize)]
struct EvaluateResponse {
    value: u32,
}

pub async fn evaluate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EvaluateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let service = find_session(&state, &id)?;
    let value = service.evaluate(&body.expr)?;
    Ok(Json(EvaluateResponse { value }))
}

pub async fn list_examples(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&state.examples_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to read examples directory: {e}")))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| ApiError::Internal(e.to_string()))? {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".s") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(Json(serde_json::json!({ "examples": names })))
}

fn valid_example_name(name: &str) -> bool {
    match name.strip_suffix(".s") {
        Some(stem) => !stem.is_empty() && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        None => false,
    }
}

pub async fn get_example(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !valid_example_name(&name) {
        return Err(ApiError::BadRequest(format!("invalid example name: {name}")));
    }
    let path = state.examples_dir.join(&name);
    let source = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("no example named {name}")))?;
    Ok(Json(serde_json::json!({ "name": name, "source": source })))
}
