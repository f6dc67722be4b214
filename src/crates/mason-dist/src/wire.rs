//! The HTTP wire surface: remote cache endpoints and the worker
//! channel.
//!
//! Framed over plain HTTP so any 1.1/2 client interoperates:
//!
//! - `GET/PUT /cache/:fingerprint`: artifact metadata
//! - `GET/PUT /cas/:hash`: blob bytes (PUT re-hashes and rejects a
//!   mismatch)
//! - `POST /actions/schedule`: assign an action to a worker
//! - `GET /workers/:id/actions`: the worker channel's request leg
//! - `POST /workers/heartbeat`, `POST /workers/result`: its reply legs
//!
//! Every request must carry the keyed-hash workspace token in
//! `x-mason-token`; a mismatch is 403 before any handler runs.

use crate::scheduler::DistributedScheduler;
use crate::{WorkerId, WorkerRegistry};
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use mason_cache::{ActionId, ContentStore, TargetCacheEntry, TOKEN_HEADER};
use mason_exec::Priority;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Ask the coordinator to run an action somewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: ActionId,
    pub priority: Priority,
    pub fingerprint: String,
}

/// A worker reporting an action outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: ActionId,
    pub worker: WorkerId,
    pub success: bool,
    pub output_hashes: Vec<String>,
    pub message: Option<String>,
}

/// Worker liveness signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker: WorkerId,
    pub load: f64,
}

/// The worker channel's frame alphabet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    ActionRequest(ActionRequest),
    ActionResult(ActionResult),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleResponse {
    action: ActionId,
    worker: WorkerId,
}

/// Shared state behind the router.
pub struct WireState {
    /// Expected `x-mason-token` value; `None` disables auth (tests).
    pub token: Option<String>,
    pub entries: DashMap<String, TargetCacheEntry>,
    pub store: Arc<ContentStore>,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<DistributedScheduler>,
    /// Assigned-but-unfetched requests per worker (the channel's
    /// server-side leg).
    pub queues: DashMap<WorkerId, VecDeque<ActionRequest>>,
}

impl WireState {
    pub fn new(
        token: Option<String>,
        store: Arc<ContentStore>,
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<DistributedScheduler>,
    ) -> Self {
        Self {
            token,
            entries: DashMap::new(),
            store,
            registry,
            scheduler,
            queues: DashMap::new(),
        }
    }
}

/// Build the router with the token guard and trace layer applied.
pub fn wire_router(state: Arc<WireState>) -> Router {
    Router::new()
        .route("/cache/:fingerprint", get(get_cache).put(put_cache))
        .route("/cas/:hash", get(get_blob).put(put_blob))
        .route("/actions/schedule", post(schedule_action))
        .route("/workers/heartbeat", post(worker_heartbeat))
        .route("/workers/result", post(worker_result))
        .route("/workers/:id/actions", get(poll_actions))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(
    State(state): State<Arc<WireState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.token {
        let presented = request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

async fn get_cache(
    State(state): State<Arc<WireState>>,
    Path(fingerprint): Path<String>,
) -> Response {
    match state.entries.get(&fingerprint) {
        Some(entry) => Json(entry.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_cache(
    State(state): State<Arc<WireState>>,
    Path(fingerprint): Path<String>,
    Json(entry): Json<TargetCacheEntry>,
) -> Response {
    if entry.fingerprint.as_str() != fingerprint {
        return (
            StatusCode::BAD_REQUEST,
            "fingerprint in path does not match body",
        )
            .into_response();
    }
    state.entries.insert(fingerprint, entry);
    StatusCode::OK.into_response()
}

async fn get_blob(State(state): State<Arc<WireState>>, Path(hash): Path<String>) -> Response {
    match state.store.get(&hash) {
        Ok(bytes) => bytes.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_blob(
    State(state): State<Arc<WireState>>,
    Path(hash): Path<String>,
    body: Bytes,
) -> Response {
    // The server never trusts the client's hash.
    let actual = blake3::hash(&body).to_hex().to_string();
    if actual != hash {
        return (StatusCode::BAD_REQUEST, "blob hash does not match body").into_response();
    }
    match state.store.put(&body) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "blob store write failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn schedule_action(
    State(state): State<Arc<WireState>>,
    Json(request): Json<ActionRequest>,
) -> Response {
    let worker = match state.scheduler.assign(None, &HashSet::new()) {
        Ok(worker) => worker,
        Err(err) => {
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };
    if let Err(err) = state
        .registry
        .claim_action(&worker, request.action.clone(), request.priority)
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    state
        .queues
        .entry(worker)
        .or_default()
        .push_back(request.clone());
    Json(ScheduleResponse {
        action: request.action,
        worker,
    })
    .into_response()
}

async fn poll_actions(
    State(state): State<Arc<WireState>>,
    Path(id): Path<WorkerId>,
) -> Response {
    let drained: Vec<ActionRequest> = state
        .queues
        .get_mut(&id)
        .map(|mut queue| queue.drain(..).collect())
        .unwrap_or_default();
    Json(drained).into_response()
}

async fn worker_heartbeat(
    State(state): State<Arc<WireState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> Response {
    state.registry.register(heartbeat.worker);
    match state.registry.heartbeat(&heartbeat.worker, heartbeat.load) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn worker_result(
    State(state): State<Arc<WireState>>,
    Json(result): Json<ActionResult>,
) -> Response {
    match state
        .registry
        .finish_action(&result.worker, &result.action, result.success)
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
