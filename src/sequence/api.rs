use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use super::coordinator::SequenceCoordinator;
use super::gate::ConfirmationGate;
use super::stream::ResultStream;
use super::ws;
use crate::errors::SequenceError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub coordinator: SequenceCoordinator,
    pub stream: ResultStream,
    pub gate: ConfirmationGate,
}

impl AppState {
    /// Wire the gate and the result stream onto a coordinator's store.
    pub fn new(coordinator: SequenceCoordinator) -> Self {
        let store = coordinator.store();
        Self {
            stream: ResultStream::new(
                store.clone(),
                coordinator.options().timing,
                coordinator.shutdown_token(),
            ),
            gate: ConfirmationGate::new(store),
            coordinator,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSequenceRequest {
    pub topics: Vec<String>,
    #[serde(default, alias = "sponsors")]
    pub forced_params: Vec<String>,
}

#[derive(Serialize)]
pub struct CreatedSequence {
    pub sequence_id: String,
    pub total: usize,
}

#[derive(Deserialize)]
pub struct ConfirmTopicRequest {
    pub sequence_id: String,
    pub topic_index: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SequenceError> for ApiError {
    fn from(err: SequenceError) -> Self {
        let message = err.to_string();
        match err {
            SequenceError::SequenceNotFound { .. } => ApiError::NotFound(message),
            SequenceError::InvalidRequest(_) => ApiError::BadRequest(message),
            SequenceError::StoreUnavailable(_) | SequenceError::ShuttingDown => {
                ApiError::Unavailable(message)
            }
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/params", get(list_params))
        .route("/api/sequences", post(create_sequence))
        .route(
            "/api/sequences/{id}",
            get(get_sequence).delete(delete_sequence),
        )
        .route(
            "/api/sequences/{id}/jobs/{index}/confirm",
            post(confirm_job),
        )
        .route("/api/sequences/{id}/events", get(sequence_events))
        .route("/api/sequences/{id}/ws", get(ws::sequence_ws))
        // Routes used by the existing web client
        .route("/generate-sequence", post(legacy_generate_sequence))
        .route("/sequence-status/{id}", get(get_sequence))
        .route("/confirm-topic", post(legacy_confirm_topic))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_params(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "params": state.coordinator.options().allowed_params,
    }))
}

async fn create_sequence(
    State(state): State<SharedState>,
    Json(req): Json<CreateSequenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let total = req.topics.len();
    let sequence_id = state
        .coordinator
        .create_sequence(req.topics, req.forced_params)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedSequence { sequence_id, total }),
    ))
}

async fn get_sequence(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.stream.status(&id).await?;
    Ok(Json(view))
}

async fn delete_sequence(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let existed = state
        .coordinator
        .store()
        .cleanup_sequence(&id)
        .await
        .map_err(SequenceError::from)?;
    if !existed {
        return Err(SequenceError::SequenceNotFound { id }.into());
    }
    debug!(sequence_id = %id, "sequence removed");
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm_job(
    State(state): State<SharedState>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<impl IntoResponse, ApiError> {
    state.gate.confirm(&id, index).await?;
    Ok(Json(serde_json::json!({
        "sequence_id": id,
        "index": index,
        "confirmed": true,
    })))
}

async fn sequence_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.stream.subscribe(&id).await?;
    let stream = ReceiverStream::new(events).map(|event| {
        let sse = Event::default().event(event.name());
        Ok::<_, Infallible>(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(e) => Event::default().event("error").data(e.to_string()),
        })
    });
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn legacy_generate_sequence(
    State(state): State<SharedState>,
    Json(req): Json<CreateSequenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sequence_id = state
        .coordinator
        .create_sequence(req.topics, req.forced_params)
        .await?;
    Ok(Json(serde_json::json!({ "sequence_id": sequence_id })))
}

async fn legacy_confirm_topic(
    State(state): State<SharedState>,
    Json(req): Json<ConfirmTopicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.gate.confirm(&req.sequence_id, req.topic_index).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
