//! HTTP surface: health, dispatch triggers, event emission, spend and the
//! live event stream.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{error, info};

use crate::edge::{
    cors_layer, guardrail_filter, rate_limit, require_internal_token, require_trigger_key,
    verify_signature, EdgeState,
};
use crate::error::{DispatchError, StoreError};
use crate::events::EmitReport;
use crate::model::{period_key, SpendPeriod};
use crate::queue::DispatchOptions;
use crate::runtime::Runtime;

/// Frames a slow SSE client may fall behind before it is dropped
const STREAM_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub edge: EdgeState,
}

#[derive(Debug)]
pub enum ApiError {
    Dispatch(DispatchError),
    Store(StoreError),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Dispatch(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Dispatch(DispatchError::UnknownAgent(agent)) => {
                (StatusCode::NOT_FOUND, format!("unknown agent: {agent}"))
            }
            ApiError::Dispatch(DispatchError::InvalidOptions(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::Dispatch(DispatchError::Store(e)) | ApiError::Store(e) => {
                error!(error = %e, "Store error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub job_id: String,
    pub agent: String,
    pub job_type: String,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub agent: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub options: DispatchOptions,
}

pub fn router(state: AppState) -> Router {
    let edge = state.edge.clone();

    let webhooks = Router::new()
        .route("/webhooks/{agent}/{job_type}", post(webhook_dispatch))
        .route_layer(from_fn_with_state(edge.clone(), verify_signature));

    let triggers = Router::new()
        .route("/trigger/{agent}/{job_type}", post(trigger_dispatch))
        .route_layer(from_fn_with_state(edge.clone(), require_trigger_key));

    let internal = Router::new()
        .route("/internal/dispatch", post(internal_dispatch))
        .route("/internal/events/{name}", post(emit_event))
        .route("/internal/spend", get(current_spend))
        .route_layer(from_fn_with_state(edge.clone(), require_internal_token));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/stream", get(stream))
        .merge(webhooks)
        .merge(triggers)
        .merge(internal)
        .layer(from_fn_with_state(edge.clone(), guardrail_filter))
        .layer(from_fn_with_state(edge.clone(), rate_limit))
        .layer(cors_layer(&edge.config.cors_origins))
        .with_state(state)
}

async fn index() -> Json<Value> {
    Json(json!({
        "name": "agent-dispatch",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "GET /stream",
            "POST /webhooks/{agent}/{job_type}",
            "POST /trigger/{agent}/{job_type}",
            "POST /internal/dispatch",
            "POST /internal/events/{name}",
            "GET /internal/spend",
        ],
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn dispatch(
    state: &AppState,
    agent: &str,
    job_type: &str,
    payload: Value,
    options: DispatchOptions,
    source: &'static str,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let handle = state
        .runtime
        .fabric
        .dispatch(agent, job_type, payload, options)
        .await?;
    info!(agent, job_type, job_id = %handle.id, source, "Dispatch accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            job_id: handle.id.to_string(),
            agent: handle.agent,
            job_type: handle.job_type,
        }),
    ))
}

async fn webhook_dispatch(
    State(state): State<AppState>,
    Path((agent, job_type)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    dispatch(&state, &agent, &job_type, payload, DispatchOptions::default(), "webhook").await
}

async fn trigger_dispatch(
    State(state): State<AppState>,
    Path((agent, job_type)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    dispatch(&state, &agent, &job_type, payload, DispatchOptions::default(), "trigger").await
}

async fn internal_dispatch(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    dispatch(
        &state,
        &request.agent,
        &request.job_type,
        request.payload,
        request.options,
        "internal",
    )
    .await
}

async fn emit_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<Value>,
) -> Json<EmitReport> {
    Json(state.runtime.events.emit(&name, payload).await)
}

async fn current_spend(State(state): State<AppState>) -> Result<Json<SpendPeriod>, ApiError> {
    let period = state
        .runtime
        .store
        .spend_period(&period_key(Utc::now()), state.runtime.config.budget.monthly_limit_usd)
        .await?;
    Ok(Json(period))
}

async fn stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (guard, rx) = state.runtime.broadcaster.subscribe(STREAM_BUFFER);
    info!(sink = guard.id().0, "Live stream observer connected");

    let events = ReceiverStream::new(rx).map(move |frame| {
        // Unregisters the sink when the client goes away
        let _connected = &guard;
        Ok::<_, Infallible>(
            Event::default()
                .event(frame.event)
                .data(frame.data.to_string()),
        )
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
