//! Local admission HTTP surface. Thin handlers over the orchestrator; all
//! policy lives below. Requests are served in parallel and serialize on
//! the orchestrator's lifecycle mutex.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;
use crate::types::{CreateInstanceRequest, ManageInstanceRequest};

type SharedOrchestrator = Arc<Orchestrator>;

#[derive(Debug, Deserialize)]
struct SshKeyRequest {
    public_key: String,
}

fn internal_error(err: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)).into_response()
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn create_instance(
    State(orch): State<SharedOrchestrator>,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    match orch.create_instance(req).await {
        Ok(state) => {
            let body = serde_json::json!({
                "instance_id": state.instance_id,
                "ports": state.ports,
            });
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => {
            error!("failed to create instance: {:#}", e);
            internal_error(e)
        }
    }
}

async fn delete_instance(State(orch): State<SharedOrchestrator>) -> Response {
    // Teardown runs asynchronously; the caller polls state if it cares.
    tokio::spawn(async move {
        info!("starting to delete instance");
        match orch.destroy_instance().await {
            Ok(()) => info!("instance deleted in background"),
            Err(e) => error!("failed to delete instance asynchronously: {:#}", e),
        }
    });

    let body = serde_json::json!({ "message": "Instance deletion started" });
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

async fn manage_instance(
    State(orch): State<SharedOrchestrator>,
    Json(req): Json<ManageInstanceRequest>,
) -> Response {
    match orch.manage_instance(req.action).await {
        Ok(()) => {
            let body = serde_json::json!({
                "message": format!("Action '{}' initiated successfully", req.action),
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn instance_logs(State(orch): State<SharedOrchestrator>) -> Response {
    match orch.instance_logs().await {
        Ok(logs) => (StatusCode::OK, logs).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_ssh_keys(State(orch): State<SharedOrchestrator>) -> Response {
    match orch.list_ssh_keys().await {
        Ok(keys) => Json(serde_json::json!({ "keys": keys })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn add_ssh_key(
    State(orch): State<SharedOrchestrator>,
    Json(req): Json<SshKeyRequest>,
) -> Response {
    if req.public_key.is_empty() {
        return (StatusCode::BAD_REQUEST, "public_key field is required").into_response();
    }
    match orch.add_ssh_key(&req.public_key).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn remove_ssh_key(
    State(orch): State<SharedOrchestrator>,
    Json(req): Json<SshKeyRequest>,
) -> Response {
    if req.public_key.is_empty() {
        return (StatusCode::BAD_REQUEST, "public_key field is required").into_response();
    }
    match orch.remove_ssh_key(&req.public_key).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => internal_error(e),
    }
}

pub fn router(orchestrator: SharedOrchestrator) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/instances",
            axum::routing::post(create_instance)
                .delete(delete_instance)
                .put(manage_instance),
        )
        .route("/instances/logs", get(instance_logs))
        .route(
            "/ssh",
            get(list_ssh_keys)
                .post(add_ssh_key)
                .delete(remove_ssh_key),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}
