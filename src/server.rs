//! HTTP surface: event intake, run lookup and the delivery webhook.

use crate::collaborators::MessageId;
use crate::context::RunId;
use crate::delivery::PushedDeliveryStatus;
use crate::dispatcher::{EventDispatcher, TriggerPayload};
use crate::error::ValidationError;
use crate::outcome::OutcomeError;
use crate::providers::delivery_state_from_event;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<EventDispatcher>,
    /// Present in webhook delivery mode; webhook updates are dropped otherwise.
    pub pushed: Option<Arc<PushedDeliveryStatus>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(submit_event))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/webhooks/email", post(email_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum AppError {
    Validation(ValidationError),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Validation(e)
    }
}

impl From<OutcomeError> for AppError {
    fn from(e: OutcomeError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::Internal(msg) => {
                warn!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };
        (status, Json(json!({"error": {"code": code, "message": message}}))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn submit_event(
    State(state): State<AppState>,
    Json(trigger): Json<TriggerPayload>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let run_id = state.dispatcher.on_event(trigger).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"run_id": run_id}))))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id: RunId = run_id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("'{run_id}' is not a run id")))?;

    if state.dispatcher.is_running(run_id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({"run_id": run_id, "status": "running"})),
        )
            .into_response());
    }
    match state.dispatcher.outcomes().get(run_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(AppError::NotFound(format!("run {run_id} not found"))),
    }
}

/// Resend-style webhook body: `{"type": "email.delivered", "data": {"email_id": "..."}}`.
#[derive(Debug, Deserialize)]
struct EmailWebhook {
    #[serde(rename = "type")]
    event_type: String,
    data: EmailWebhookData,
}

#[derive(Debug, Deserialize)]
struct EmailWebhookData {
    email_id: String,
}

async fn email_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<EmailWebhook>,
) -> Json<serde_json::Value> {
    let applied = match (&state.pushed, delivery_state_from_event(&webhook.event_type)) {
        (Some(pushed), Some(delivery_state)) => {
            pushed.record(MessageId::new(webhook.data.email_id.clone()), delivery_state)
        }
        _ => false,
    };
    debug!(
        event_type = %webhook.event_type,
        message_id = %webhook.data.email_id,
        applied,
        "email webhook received"
    );
    Json(json!({"applied": applied}))
}
