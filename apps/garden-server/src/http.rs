//! HTTP job surface.
//!
//! Every request becomes an [`Operation`] and goes through the router, so a
//! `?garden=<name>` query parameter reaches jobs on a remote garden the same
//! way a local request reaches this one.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response as HttpResponse},
    routing::get,
    Json, Router as HttpRouter,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use garden_core::{ErrorKind, JobDefinition, Operation, OperationKind, PatchRequest};
use garden_sync::{GardenAgentHandle, Router, SyncError};

/// Query parameter naming the garden that owns the jobs.
const GARDEN_PARAM: &str = "garden";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub agent: Option<GardenAgentHandle>,
}

pub fn app(state: AppState) -> HttpRouter {
    HttpRouter::new()
        .route("/health", get(health_handler))
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route(
            "/api/v1/jobs/{id}",
            get(get_job).patch(patch_job).delete(delete_job),
        )
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// Maps a routing failure to a status code and an `ErrorMessage` body.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let status = match (&self.0, self.0.kind()) {
            (SyncError::NotFound { .. }, _) => StatusCode::NOT_FOUND,
            (_, ErrorKind::Parse | ErrorKind::Validation | ErrorKind::Routing) => {
                StatusCode::BAD_REQUEST
            }
            (_, ErrorKind::RemoteUnreachable) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::Backend) => StatusCode::BAD_GATEWAY,
            (_, ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        debug!(%status, error = %self.0, "Request failed");
        (status, Json(self.0.to_error_message())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let broker = state
        .agent
        .as_ref()
        .map(|agent| format!("{:?}", agent.status().connection_state));

    Json(json!({
        "status": "OK",
        "garden": state.router.garden_name(),
        "broker": broker,
    }))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let garden = params.remove(GARDEN_PARAM);
    let filter: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let operation = targeted(Operation::new(OperationKind::JobReadAll), garden)
        .with_kwarg("filter_params", Value::Object(filter));
    route(&state, operation).await.map(Json)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let operation = targeted(Operation::new(OperationKind::JobRead), garden_of(&params))
        .with_kwarg("job_id", Value::String(id));
    route(&state, operation).await.map(Json)
}

async fn create_job(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(definition): Json<JobDefinition>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = serde_json::to_value(definition).map_err(SyncError::from)?;
    let operation = targeted(Operation::new(OperationKind::JobCreate), garden_of(&params))
        .with_kwarg("job", job);

    let created = route(&state, operation).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(patch): Json<PatchRequest>,
) -> ApiResult<Json<Value>> {
    let patch = serde_json::to_value(patch).map_err(SyncError::from)?;
    let operation = targeted(Operation::new(OperationKind::JobUpdate), garden_of(&params))
        .with_kwarg("job_id", Value::String(id))
        .with_kwarg("patch", patch);
    route(&state, operation).await.map(Json)
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let operation = targeted(Operation::new(OperationKind::JobDelete), garden_of(&params))
        .with_kwarg("job_id", Value::String(id));
    route(&state, operation).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Helpers
// =============================================================================

async fn route(state: &AppState, operation: Operation) -> ApiResult<Value> {
    Ok(state.router.route(operation).await?.payload)
}

fn garden_of(params: &HashMap<String, String>) -> Option<String> {
    params.get(GARDEN_PARAM).cloned()
}

fn targeted(operation: Operation, garden: Option<String>) -> Operation {
    match garden {
        Some(garden) => operation.with_target(garden),
        None => operation,
    }
}
