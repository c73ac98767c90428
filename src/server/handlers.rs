//! REST handlers: health, dialogs, history, tool results, checkpoints,
//! sessions and config.
//!
//! Every failure returns a JSON body with a stable `detail` string.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::config::ConfigFile;

/// JSON error with a `detail` body.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// ---- health ----

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let doc = state.status.get_status();
    Json(json!({
        "status": "ok",
        "port": state.port,
        "pid": std::process::id(),
        "server_status": doc.get("server_status"),
        "config_valid": doc.get("config_valid"),
        "config_errors": doc.get("config_errors"),
    }))
}

// ---- dialogs ----

#[derive(Debug, Deserialize)]
pub struct ListDialogsQuery {
    #[serde(default = "default_sort")]
    sort: String,
    #[serde(default = "default_order")]
    order: String,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

fn default_sort() -> String {
    "updated_at".into()
}

fn default_order() -> String {
    "desc".into()
}

pub async fn list_dialogs(
    State(state): State<AppState>,
    Query(query): Query<ListDialogsQuery>,
) -> Json<serde_json::Value> {
    let descending = !query.order.eq_ignore_ascii_case("asc");
    let dialogs = state.project.list_dialogs(
        &query.sort,
        descending,
        query.limit.or(Some(50)),
        query.offset,
    );
    Json(json!({
        "current_dialog_id": state.project.get_current_dialog_id(),
        "dialogs": dialogs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateDialogRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default = "default_true")]
    set_current: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_dialog(
    State(state): State<AppState>,
    Json(request): Json<CreateDialogRequest>,
) -> ApiResult {
    let dialog_id = state
        .chat
        .create_dialog(request.title, request.set_current)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "id": dialog_id })))
}

pub async fn get_current_dialog(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.project.get_current_dialog_id() {
        Some(dialog_id) => {
            let meta = state.project.get_dialog_meta(&dialog_id);
            Json(json!({ "id": dialog_id, "meta": meta }))
        }
        None => Json(json!({ "id": null, "meta": null })),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetCurrentQuery {
    id: String,
}

pub async fn set_current_dialog(
    State(state): State<AppState>,
    Query(query): Query<SetCurrentQuery>,
) -> ApiResult {
    state
        .project
        .set_current_dialog_id(&query.id)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn get_dialog(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let meta = state
        .project
        .get_dialog_meta(&id)
        .ok_or_else(|| ApiError::not_found("Dialog not found"))?;
    let usage = state.store.get_usage(&id).await.map_err(ApiError::internal)?;
    let mut value = serde_json::to_value(meta).map_err(ApiError::internal)?;
    value["usage"] = serde_json::to_value(usage).map_err(ApiError::internal)?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct PatchDialogRequest {
    title: Option<String>,
}

pub async fn patch_dialog(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchDialogRequest>,
) -> ApiResult {
    if let Some(title) = request.title {
        state
            .project
            .upsert_dialog_meta(&id, Some(title), None, None)
            .map_err(|e| ApiError::not_found(e.to_string()))?;
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_dialog(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state
        .project
        .delete_dialog(&id)
        .map_err(ApiError::internal)?;
    state
        .store
        .delete_dialog(&id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "ok": true })))
}

// ---- history ----

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
    before: Option<i64>,
}

fn default_history_limit() -> i64 {
    50
}

pub async fn dialog_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    if state.project.get_dialog_meta(&id).is_none() {
        return Err(ApiError::not_found("Dialog not found"));
    }
    let page = state
        .store
        .history_page(&id, query.limit, query.before)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::to_value(page).map_err(ApiError::internal)?))
}

// ---- tool results ----

pub async fn list_tool_results(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let results = state
        .store
        .list_tool_result_meta(&id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "dialog_id": id, "results": results })))
}

pub async fn get_tool_result(
    State(state): State<AppState>,
    Path((id, tool_call_id)): Path<(String, String)>,
) -> ApiResult {
    let store = crate::dialogs::ToolResultStore::new(&state.project.dialog_dir(&id));
    let result = store
        .get(&tool_call_id)
        .map_err(|_| ApiError::not_found(format!("Tool result not found: {tool_call_id}")))?;
    let meta = store.get_metadata(&tool_call_id).ok();
    Ok(Json(json!({
        "tool_call_id": tool_call_id,
        "metadata": meta,
        "result": result,
    })))
}

// ---- checkpoints ----

pub async fn list_checkpoints(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if state.project.get_dialog_meta(&id).is_none() {
        return Err(ApiError::not_found("Dialog not found"));
    }
    let tracker = state.chat.tracker_for(&id).await.map_err(ApiError::internal)?;
    let checkpoints = tracker
        .list_checkpoints()
        .await
        .map_err(ApiError::internal)?;
    let initial_checkpoint = state
        .project
        .get_dialog_meta(&id)
        .and_then(|meta| meta.initial_checkpoint);
    Ok(Json(json!({
        "dialog_id": id,
        "checkpoints": checkpoints,
        "initial_checkpoint": initial_checkpoint,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    checkpoint_id: String,
}

pub async fn restore_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult {
    let tracker = state.chat.tracker_for(&id).await.map_err(ApiError::internal)?;
    if !tracker.has_commit(&request.checkpoint_id) {
        return Err(ApiError::not_found(format!(
            "Checkpoint {} not found in dialog {id}",
            request.checkpoint_id
        )));
    }
    let outcome = tracker
        .restore_checkpoint(&request.checkpoint_id)
        .await
        .map_err(ApiError::internal)?;

    // Bring the index back in line with the restored tree.
    if let Err(e) = state.chat.rag().full_sync().await {
        tracing::warn!(dialog_id = %id, error = %e, "RAG sync after restore failed");
    }

    Ok(Json(json!({
        "restored_to": outcome.restored_to,
        "new_checkpoint": outcome.new_checkpoint,
        "skipped_files": outcome.skipped_files,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    message: Option<String>,
}

pub async fn approve_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult {
    let tracker = state.chat.tracker_for(&id).await.map_err(ApiError::internal)?;
    let message = request.message;
    let outcome = tracker
        .approve_all(message.as_deref())
        .await
        .map_err(ApiError::internal)?;
    state
        .project
        .upsert_dialog_meta(&id, None, None, Some(chrono::Utc::now().to_rfc3339()))
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

pub async fn reset_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let tracker = state.chat.tracker_for(&id).await.map_err(ApiError::internal)?;
    let outcome = tracker
        .reset_to_approved()
        .await
        .map_err(ApiError::internal)?;
    if let Err(e) = state.chat.rag().full_sync().await {
        tracing::warn!(dialog_id = %id, error = %e, "RAG sync after reset failed");
    }
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

pub async fn session_state(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let meta = state
        .project
        .get_dialog_meta(&id)
        .ok_or_else(|| ApiError::not_found("Dialog not found"))?;
    let tracker = state.chat.tracker_for(&id).await.map_err(ApiError::internal)?;
    let active_session = tracker
        .active_session_name()
        .await
        .map_err(ApiError::internal)?;
    let changed_files = tracker
        .get_staged_files()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "active_session": active_session,
        "session_ref": format!("refs/{active_session}"),
        "has_unapproved": !changed_files.is_empty(),
        "last_approved_at": meta.last_approved_at,
        "changed_files": changed_files,
    })))
}

// ---- config ----

pub async fn get_config(State(state): State<AppState>) -> ApiResult {
    let global = state
        .settings
        .read_global()
        .map_err(ApiError::internal)?;
    let mut value = serde_json::to_value(&global).map_err(ApiError::internal)?;
    // Never echo secrets back to clients.
    if value.get("api_key").is_some() {
        value["api_key"] = json!("***");
    }
    Ok(Json(json!({
        "global": value,
        "config_errors": state.settings.validate(),
    })))
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<ConfigFile>,
) -> ApiResult {
    state
        .settings
        .write_global(&config)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RenameProfileRequest {
    from: String,
    to: String,
}

pub async fn rename_config_profile(
    State(state): State<AppState>,
    Json(request): Json<RenameProfileRequest>,
) -> ApiResult {
    if request.from.is_empty() || request.to.is_empty() {
        return Err(ApiError::bad_request("from and to must be non-empty"));
    }
    state
        .settings
        .rename_profile(&request.from, &request.to)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}
