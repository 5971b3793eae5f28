//! Local HTTP listeners for the three approval channels.
//!
//! Each channel gets its own listener on its own fixed port so tool-side
//! callers can be pointed at a single-purpose URL. All three share the
//! arbiter; a request blocks its HTTP call until the user decides or the
//! primary timeout passes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use bw_core::errors::EngineError;

use crate::arbiter::{
    CommercePermissionRequest, FilePermissionRequest, PermissionArbiter, QuestionRequest,
};

/// Handles for the three running listeners. Ports are the actual bound
/// ports, which matters when a config asks for port 0.
pub struct ApprovalServers {
    pub file_port: u16,
    pub question_port: u16,
    pub commerce_port: u16,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl ApprovalServers {
    /// Bind and serve all three channels on localhost.
    pub async fn start(
        arbiter: Arc<PermissionArbiter>,
        file_port: u16,
        question_port: u16,
        commerce_port: u16,
    ) -> Result<Self, EngineError> {
        let mut handles = Vec::with_capacity(3);

        // Anything but the expected POST is a 404, wrong method included.
        let file_router = Router::new()
            .route("/permissions/file", post(handle_file_permission))
            .method_not_allowed_fallback(not_found)
            .layer(CorsLayer::permissive())
            .with_state(arbiter.clone());
        let (file_port, file_handle) = serve(file_router, file_port).await?;
        handles.push(file_handle);

        let question_router = Router::new()
            .route("/question", post(handle_question))
            .method_not_allowed_fallback(not_found)
            .layer(CorsLayer::permissive())
            .with_state(arbiter.clone());
        let (question_port, question_handle) = serve(question_router, question_port).await?;
        handles.push(question_handle);

        let commerce_router = Router::new()
            .route("/permissions/commerce", post(handle_commerce_permission))
            .method_not_allowed_fallback(not_found)
            .layer(CorsLayer::permissive())
            .with_state(arbiter);
        let (commerce_port, commerce_handle) = serve(commerce_router, commerce_port).await?;
        handles.push(commerce_handle);

        info!(
            file_port,
            question_port, commerce_port, "Approval listeners started"
        );
        Ok(Self {
            file_port,
            question_port,
            commerce_port,
            handles,
        })
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ApprovalServers {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    router: Router,
    port: u16,
) -> Result<(u16, tokio::task::JoinHandle<()>), EngineError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| EngineError::Http(format!("failed to bind approval port {port}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| EngineError::Http(e.to_string()))?
        .port();
    let handle = tokio::spawn(async move {
        // Serve until aborted at shutdown.
        let _ = axum::serve(listener, router).await;
    });
    Ok((bound, handle))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn handle_file_permission(
    State(arbiter): State<Arc<PermissionArbiter>>,
    Json(request): Json<FilePermissionRequest>,
) -> Response {
    match arbiter.request_file_permission(request).await {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(err) => timeout_response(err),
    }
}

async fn handle_question(
    State(arbiter): State<Arc<PermissionArbiter>>,
    Json(request): Json<QuestionRequest>,
) -> Response {
    match arbiter.ask_question(request).await {
        Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
        Err(err) => timeout_response(err),
    }
}

async fn handle_commerce_permission(
    State(arbiter): State<Arc<PermissionArbiter>>,
    Json(request): Json<CommercePermissionRequest>,
) -> Response {
    match arbiter.request_commerce_permission(request).await {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(err) => timeout_response(err),
    }
}

/// Undecided requests come back as an explicit denial, not a hung
/// connection, so tool-side callers always get a verdict.
fn timeout_response(err: EngineError) -> Response {
    (
        StatusCode::REQUEST_TIMEOUT,
        Json(json!({
            "approved": false,
            "reason": err.to_string(),
        })),
    )
        .into_response()
}
