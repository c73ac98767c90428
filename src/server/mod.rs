//! HTTP surface: axum router, shared state and the serve loop.

pub mod handlers;
pub mod stream;

use std::sync::Arc;

use anyhow::Result;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::chat::ChatService;
use crate::config::Settings;
use crate::dialogs::DialogStore;
use crate::project::status::StatusManager;
use crate::project::Project;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub project: Arc<Project>,
    pub chat: Arc<ChatService>,
    pub store: DialogStore,
    pub settings: Arc<Settings>,
    pub status: Arc<StatusManager>,
    pub shutdown: CancellationToken,
    pub port: u16,
}

/// Build the router with every endpoint mounted.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/chat", post(stream::chat))
        .route(
            "/api/dialogs",
            get(handlers::list_dialogs).post(handlers::create_dialog),
        )
        .route(
            "/api/dialogs/current",
            get(handlers::get_current_dialog).patch(handlers::set_current_dialog),
        )
        .route(
            "/api/dialogs/{id}",
            get(handlers::get_dialog)
                .patch(handlers::patch_dialog)
                .delete(handlers::delete_dialog),
        )
        .route("/api/dialogs/{id}/history", get(handlers::dialog_history))
        .route(
            "/api/dialogs/{id}/tool-results",
            get(handlers::list_tool_results),
        )
        .route(
            "/api/dialogs/{id}/tool-results/{tool_call_id}",
            get(handlers::get_tool_result),
        )
        .route(
            "/api/dialogs/{id}/checkpoints",
            get(handlers::list_checkpoints),
        )
        .route("/api/dialogs/{id}/restore", post(handlers::restore_checkpoint))
        .route("/api/dialogs/{id}/approve", post(handlers::approve_session))
        .route("/api/dialogs/{id}/reset", post(handlers::reset_session))
        .route("/api/dialogs/{id}/session", get(handlers::session_state))
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::put_config),
        )
        .route("/api/config/rename", post(handlers::rename_config_profile))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn run(state: AppState, host: &str, port: u16) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let status = state.status.clone();
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;

    // The transport is listening; clients may connect now.
    status.update_server_status(crate::project::ServerStatus::Ready, None, None, None);
    info!(host, port, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
