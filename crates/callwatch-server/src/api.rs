//! REST API over the call state machine and the monitoring handler

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use callwatch_core::{
    AlertId, AuditEntry, CallKind, CallSession, Callwatch, CallwatchError, Channel, MonitoringAlert,
    MonitoringView, SessionId, Severity, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub callwatch: Callwatch,
}

/// Create the REST API router
pub fn create_router(callwatch: Callwatch) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/calls", post(create_call))
        .route("/calls/:id", get(get_call))
        .route("/calls/:id/accept", post(accept_call))
        .route("/calls/:id/decline", post(decline_call))
        .route("/calls/:id/stop", post(stop_call))
        .route("/monitoring/sessions", get(list_sessions))
        .route("/monitoring/sessions/:id/flag", post(flag_session))
        .route("/monitoring/sessions/:id/join", post(join_session))
        .route("/monitoring/alerts", get(list_alerts))
        .route("/monitoring/alerts/:id/resolve", post(resolve_alert))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { callwatch })
}

/// Error body `{ "error": code, "message": text }`
#[derive(Debug)]
pub struct ApiError(pub CallwatchError);

impl From<CallwatchError> for ApiError {
    fn from(err: CallwatchError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CallwatchError::NotFound(_) => StatusCode::NOT_FOUND,
            CallwatchError::InvalidTransition { .. }
            | CallwatchError::AlreadyHandled { .. }
            | CallwatchError::StoreConflict { .. } => StatusCode::CONFLICT,
            CallwatchError::CannotDecline(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CallwatchError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct CreateCallRequest {
    pub client_id: UserId,
    pub kind: CallKind,
    pub channel: Channel,
    pub reader_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct ResponderRequest {
    pub responder_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub actor_id: UserId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    pub actor_id: UserId,
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Filter on resolution status, all alerts when absent
    pub resolved: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub live_sessions: usize,
    pub pending_timers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        live_sessions: state.callwatch.aggregator.snapshot().len(),
        pending_timers: state.callwatch.machine.timers().pending_count(),
    })
}

async fn create_call(
    State(state): State<AppState>,
    Json(req): Json<CreateCallRequest>,
) -> Result<(StatusCode, Json<CallSession>), ApiError> {
    let session = state
        .callwatch
        .machine
        .create(req.client_id, req.kind, req.channel, req.reader_id)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_call(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CallSession> {
    Ok(Json(state.callwatch.machine.get(&SessionId::from(id)).await?))
}

async fn accept_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResponderRequest>,
) -> ApiResult<CallSession> {
    let session = state
        .callwatch
        .machine
        .accept(&SessionId::from(id), req.responder_id)
        .await?;
    Ok(Json(session))
}

async fn decline_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResponderRequest>,
) -> ApiResult<CallSession> {
    let session = state
        .callwatch
        .machine
        .decline(&SessionId::from(id), req.responder_id)
        .await?;
    Ok(Json(session))
}

async fn stop_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StopRequest>,
) -> ApiResult<CallSession> {
    let session = state
        .callwatch
        .actions
        .force_stop(&SessionId::from(id), req.actor_id, req.reason)
        .await?;
    Ok(Json(session))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Vec<MonitoringView>> {
    Ok(Json(state.callwatch.aggregator.list_active().await?))
}

async fn list_alerts(State(state): State<AppState>, Query(query): Query<AlertQuery>) -> ApiResult<Vec<MonitoringAlert>> {
    let alerts = match query.resolved {
        Some(false) => state.callwatch.aggregator.list_alerts(true).await?,
        Some(true) => state
            .callwatch
            .aggregator
            .list_alerts(false)
            .await?
            .into_iter()
            .filter(|alert| alert.resolved)
            .collect(),
        None => state.callwatch.aggregator.list_alerts(false).await?,
    };
    Ok(Json(alerts))
}

async fn flag_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FlagRequest>,
) -> Result<(StatusCode, Json<MonitoringAlert>), ApiError> {
    let alert = state
        .callwatch
        .actions
        .flag(&SessionId::from(id), req.actor_id, req.reason, req.severity)
        .await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<AuditEntry> {
    let entry = state
        .callwatch
        .actions
        .join(&SessionId::from(id), req.actor_id)
        .await?;
    Ok(Json(entry))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<MonitoringAlert> {
    let alert = state
        .callwatch
        .actions
        .resolve_alert(&AlertId::from(id.as_str()), req.actor_id)
        .await?;
    Ok(Json(alert))
}
