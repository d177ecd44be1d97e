//! Emergency lockdown: the irreversible teardown every monitor escalates
//! to. Steps are best-effort and individually logged; the process exit at
//! the end guards against re-entry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::state::StateStore;

/// The two callbacks every monitor needs to seal the host: force-destroy
/// the tenant and tell the control plane why.
#[async_trait::async_trait]
pub trait LockdownDeps: Send + Sync {
    async fn destroy_instance(&self) -> Result<()>;
    async fn report_incident(&self, incident_type: &str, reason: &str) -> Result<()>;
}

/// Constructed once at startup and shared by handle with every monitor.
#[derive(Clone)]
pub struct LockdownHandle {
    deps: Arc<dyn LockdownDeps>,
    store: Arc<StateStore>,
    marker: PathBuf,
}

impl LockdownHandle {
    pub fn new(deps: Arc<dyn LockdownDeps>, store: Arc<StateStore>, marker: PathBuf) -> Self {
        Self { deps, store, marker }
    }

    /// Run the lockdown steps without terminating, so the protocol itself
    /// is testable. Callers that must seal the host use
    /// [`initiate`](Self::initiate).
    pub async fn execute(&self, reason: &str) {
        error!("[Security] !!! CRITICAL SECURITY THREAT DETECTED !!! reason: {}", reason);
        error!("[Security] initiating emergency lockdown");

        // 1. Marker first: whatever happens next, the supervisor must not
        //    auto-restart this host.
        match tokio::fs::write(&self.marker, b"").await {
            Ok(()) => info!("[Security] lockdown marker created at {}", self.marker.display()),
            Err(e) => error!("[Security] failed to create lockdown marker: {}", e),
        }

        // 2. Report the incident while the secret still exists.
        if let Err(e) = self.deps.report_incident("security_breach", reason).await {
            error!("[Security] failed to report incident: {}", e);
        }

        // 3. Destroy the tenant instance.
        match self.deps.destroy_instance().await {
            Ok(()) => info!("[Security] instance destroyed"),
            Err(e) => error!("[Security] emergency instance destruction failed: {}", e),
        }

        // 4. Shred the local secret.
        match self.store.shred_secret().await {
            Ok(()) => info!("[Security] local secret shredded"),
            Err(e) => error!("[Security] failed to shred secret: {}", e),
        }
    }

    /// Full lockdown: execute the protocol, then terminate the process with
    /// a non-zero status.
    pub async fn initiate(&self, reason: &str) -> ! {
        self.execute(reason).await;
        error!("[Security] lockdown complete, terminating agent");
        std::process::exit(1);
    }
}
