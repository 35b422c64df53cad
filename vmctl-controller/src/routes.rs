use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::{info, warn};
use vmctl_common::{ResourceKey, VmSpec};

use crate::controller::ControllerHealth;
use crate::queue::WorkQueue;
use crate::store::{ResourceStore, StoreError};

pub struct AppState {
    pub store: Arc<dyn ResourceStore>,
    pub queue: Arc<WorkQueue>,
    pub health: Arc<ControllerHealth>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/status", get(admin_status))
        .route("/apis/vms", get(list_vms))
        .route(
            "/apis/vms/{namespace}/{name}",
            get(get_vm).put(put_vm).delete(delete_vm),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "VM Controller Online"
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.health.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "synced": state.health.is_synced(),
                "leader": state.health.is_leader(),
            })),
        )
            .into_response()
    }
}

async fn admin_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let records = match state.store.list().await {
        Ok(records) => records.len() as i64,
        Err(e) => {
            warn!(error = %e, "admin status: listing failed");
            -1
        }
    };
    Json(json!({
        "records": records,
        "queue_depth": state.queue.len().await,
        "reconcile_success": state.health.successes(),
        "reconcile_failure": state.health.failures(),
        "leader": state.health.is_leader(),
        "synced": state.health.is_synced(),
    }))
}

fn store_error_response(e: StoreError) -> Response {
    let (status, code) = match &e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StoreError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        StoreError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        StoreError::Invalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid"),
        StoreError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "db_error"),
    };
    (status, Json(json!({"error": code, "message": e.to_string()}))).into_response()
}

async fn list_vms(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.store.get(&ResourceKey::new(namespace, name)).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// Creates the record or replaces its spec. Status is controller-owned and
/// cannot be written here.
async fn put_vm(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<VmSpec>,
) -> Response {
    let key = ResourceKey::new(namespace, name);
    if let Err(e) = spec.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "invalid_spec", "problems": e.problems})),
        )
            .into_response();
    }

    let mut record = match state.store.get(&key).await {
        Ok(record) => record,
        Err(StoreError::NotFound(_)) => {
            return match state.store.create(&key, spec).await {
                Ok(record) => {
                    info!(key = %key, "record created");
                    (StatusCode::CREATED, Json(record)).into_response()
                }
                Err(e) => store_error_response(e),
            };
        }
        Err(e) => return store_error_response(e),
    };

    if record.metadata.is_being_deleted() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "terminating", "message": format!("{} is being deleted", key)})),
        )
            .into_response();
    }

    record.spec = spec;
    match state.store.update(&record).await {
        Ok(Some(record)) => {
            info!(key = %key, generation = record.metadata.generation, "record spec updated");
            Json(record).into_response()
        }
        Ok(None) => store_error_response(StoreError::NotFound(key)),
        Err(e) => store_error_response(e),
    }
}

async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ResourceKey::new(namespace, name);
    match state.store.request_delete(&key).await {
        Ok(Some(record)) => {
            info!(key = %key, "deletion requested");
            (StatusCode::ACCEPTED, Json(record)).into_response()
        }
        Ok(None) => {
            info!(key = %key, "record removed");
            (StatusCode::OK, Json(json!({"status": "deleted"}))).into_response()
        }
        Err(e) => store_error_response(e),
    }
}
