//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use tracing::warn;

use crate::errors::{AppError, ErrorKind};
use crate::events::OperationWatch;
use crate::models::operation::{
    OperationAction, OperationEventType, OperationParams, OperationStatus, StoreOperationEvent,
};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every failing handler
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

/// [`AppError`] rendered as an HTTP response
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match (&self.0, kind) {
            (AppError::NotFound(_), _) => StatusCode::NOT_FOUND,
            (_, ErrorKind::Validation) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Materialization) => StatusCode::UNPROCESSABLE_ENTITY,
            (_, ErrorKind::Execution) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: kind.as_str(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "stackd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Operation started response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOperationResponse {
    pub operation_id: String,
}

/// Start a lifecycle operation; the body holds the action's parameters
pub async fn start_operation_handler(
    State(state): State<Arc<ServerState>>,
    Path((app_id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let action: OperationAction = action.parse()?;
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::ValidationError(format!("Invalid request body: {}", e)))?
    };
    let params = OperationParams::from_json(action, body)?;

    let started = state.orchestrator.start_operation(&app_id, params).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartOperationResponse {
            operation_id: started.operation_id,
        }),
    ))
}

/// Operation record
pub async fn operation_handler(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = state
        .orchestrator
        .get_operation(&operation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Operation {}", operation_id)))?;
    Ok(Json(operation))
}

/// Latest broadcast event of an operation
pub async fn latest_event_handler(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state
        .orchestrator
        .get_latest_event(&operation_id)
        .ok_or_else(|| AppError::NotFound(format!("No event for operation {}", operation_id)))?;
    Ok(Json(event))
}

struct EventStream {
    watch: OperationWatch,
    pending: Option<StoreOperationEvent>,
    done: bool,
}

fn sse_event(event: &StoreOperationEvent) -> Event {
    Event::default()
        .event(event.event_type.as_str())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Server-sent events: the latest event first, then live events until a terminal one
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let watch = state.orchestrator.watch(&operation_id);

    let mut pending = watch.snapshot.clone();
    if pending.is_none() {
        let operation = state
            .orchestrator
            .get_operation(&operation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Operation {}", operation_id)))?;

        // Terminal operations whose event was evicted still get one final event
        if operation.status.is_terminal() {
            let event_type = if operation.status == OperationStatus::Success {
                OperationEventType::Completed
            } else {
                OperationEventType::Failed
            };
            let mut event = StoreOperationEvent::from_operation(event_type, &operation);
            event.message = operation.error_message.clone();
            pending = Some(event);
        }
    }

    let stream = stream::unfold(
        EventStream {
            watch,
            pending,
            done: false,
        },
        |mut state| async move {
            if state.done {
                return None;
            }
            let event = match state.pending.take() {
                Some(event) => event,
                None => state.watch.recv().await?,
            };
            state.done = event.event_type.is_terminal();
            Some((Ok::<_, Infallible>(sse_event(&event)), state))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
