//! Container-engine API mediator.
//!
//! The engine is configured with this agent as an authorization plugin and
//! asks "allow this API call?" before executing it. Any request whose URI
//! touches a dangerous verb is denied; the engine cannot be used to reach
//! into the tenant.

use std::path::Path;

use anyhow::{Context, Result};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Engine API endpoints the tenant's operator must never reach.
const FORBIDDEN_ENDPOINTS: [&str; 8] = [
    "/exec", "/attach", "/copy", "/archive", "/commit", "/rename", "/update", "/kill",
];

#[derive(Debug, Deserialize)]
struct AuthzRequest {
    #[serde(rename = "RequestMethod", default)]
    request_method: String,
    #[serde(rename = "RequestUri", default)]
    request_uri: String,
    #[serde(rename = "User", default)]
    user: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct AuthzResponse {
    #[serde(rename = "Allow")]
    allow: bool,
    #[serde(rename = "Msg", skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
}

/// Deterministic allow/deny for one request URI.
pub fn is_forbidden(request_uri: &str) -> bool {
    FORBIDDEN_ENDPOINTS
        .iter()
        .any(|endpoint| request_uri.contains(endpoint))
}

async fn handle_activate() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Implements": ["authz"] }))
}

async fn handle_allow(body: String) -> Json<AuthzResponse> {
    let req: AuthzRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(_) => {
            warn!("[Security] [authz] malformed request from container engine, denying");
            return Json(AuthzResponse {
                allow: false,
                msg: Some("Invalid request from container engine".into()),
            });
        }
    };

    if is_forbidden(&req.request_uri) {
        warn!(
            "[Security] !!! SECURITY ALERT [authz] !!! denied dangerous API call from user '{}': {} {}",
            req.user, req.request_method, req.request_uri
        );
        return Json(AuthzResponse {
            allow: false,
            msg: Some("Action denied by Qudata Agent security policy.".into()),
        });
    }

    info!(
        "[Security] [authz] allowed API call: {} {}",
        req.request_method, req.request_uri
    );
    Json(AuthzResponse {
        allow: true,
        msg: None,
    })
}

pub fn router() -> Router {
    Router::new()
        .route("/Plugin.Activate", post(handle_activate))
        .route("/AuthZPlugin.Allow", post(handle_allow))
}

/// Bind the plugin socket and serve until the token is cancelled. Binding
/// happens before the task is spawned so a bad socket path fails startup.
pub async fn spawn_server(socket_path: &Path, cancel: CancellationToken) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))
        }
    }

    let listener = tokio::net::UnixListener::bind(socket_path)
        .with_context(|| format!("binding authz socket {}", socket_path.display()))?;
    info!("[Security] authz mediator listening on {}", socket_path.display());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!("[Security] authz mediator server failed: {}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_uris() {
        assert!(is_forbidden("/v1.43/containers/abc/exec"));
        assert!(is_forbidden("/v1.43/containers/abc/attach?stream=1"));
        assert!(is_forbidden("/v1.43/containers/abc/kill"));
        assert!(is_forbidden("/v1.43/commit?container=abc"));
        assert!(!is_forbidden("/v1.43/containers/json"));
        assert!(!is_forbidden("/v1.43/images/json"));
        assert!(!is_forbidden("/_ping"));
    }

    #[tokio::test]
    async fn test_allow_denies_forbidden_call() {
        let body = r#"{"RequestMethod":"POST","RequestUri":"/v1.43/containers/x/exec","User":"root"}"#;
        let Json(resp) = handle_allow(body.to_string()).await;
        assert!(!resp.allow);
        assert!(resp.msg.unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn test_allow_permits_benign_call() {
        let body = r#"{"RequestMethod":"GET","RequestUri":"/v1.43/containers/json"}"#;
        let Json(resp) = handle_allow(body.to_string()).await;
        assert!(resp.allow);
        assert!(resp.msg.is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_denied() {
        let Json(resp) = handle_allow("{broken".to_string()).await;
        assert!(!resp.allow);
    }

    #[tokio::test]
    async fn test_activate_handshake() {
        let Json(value) = handle_activate().await;
        assert_eq!(value, serde_json::json!({ "Implements": ["authz"] }));
    }
}
