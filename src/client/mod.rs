//! Outbound control-plane client.
//!
//! Bootstrap calls carry `X-Api-Key`; once the control plane hands out an
//! agent secret, every call carries `X-Agent-Secret` as well. A stored
//! secret is never cleared by a later empty one.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{
    AgentResponse, CreateHostRequest, IncidentRequest, InitAgentRequest, StatsRequest,
};

const DEFAULT_BASE_URL: &str = "https://internal.qudata.ai/v0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 3;

pub struct QudataClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    secret: RwLock<Option<String>>,
}

impl QudataClient {
    pub fn new(api_key: String, secret: Option<String>) -> Result<Self> {
        Self::with_base_url(api_key, secret, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        secret: Option<String>,
        base_url: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            secret: RwLock::new(secret.filter(|s| !s.is_empty())),
        })
    }

    /// Adopt a freshly issued secret. Empty secrets are ignored so a
    /// re-registration cannot strip an existing credential.
    pub async fn update_secret(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        *self.secret.write().await = Some(secret.to_string());
    }

    async fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
        is_init: bool,
        retry: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let secret = self.secret.read().await.clone();

        if !is_init && secret.is_none() {
            bail!("cannot call {}: agent secret key is missing", path);
        }

        let attempts = if retry { MAX_ATTEMPTS } else { 1 };
        let mut last_err = None;

        for attempt in 1..=attempts {
            let mut req = self.http.post(&url);
            if is_init {
                req = req.header("X-Api-Key", &self.api_key);
            }
            if let Some(s) = &secret {
                req = req.header("X-Agent-Secret", s);
            }
            if let Some(b) = &body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    last_err = Some(anyhow::anyhow!(
                        "server returned {} for {}",
                        resp.status(),
                        path
                    ));
                }
                Err(e) => last_err = Some(anyhow::Error::new(e).context(format!("POST {}", path))),
            }

            if attempt < attempts {
                // 1 s, 3 s, 5 s ladder
                let backoff = Duration::from_secs((2 * attempt as u64 - 1).min(5));
                debug!(path, attempt, backoff = ?backoff, "control-plane call failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap())
    }

    /// Register the agent. The caller persists any returned secret and
    /// feeds it back via [`update_secret`](Self::update_secret).
    pub async fn init_agent(&self, req: &InitAgentRequest) -> Result<AgentResponse> {
        let resp = self
            .post("/init", Some(serde_json::to_value(req)?), true, true)
            .await?;
        let agent: AgentResponse = resp.json().await.context("decoding /init response")?;
        info!(
            host_exists = agent.host_exists,
            emergency_reinit = agent.emergency_reinit,
            "agent registered"
        );
        Ok(agent)
    }

    /// Upload the hardware report for a new host.
    pub async fn create_host(&self, req: &CreateHostRequest) -> Result<()> {
        self.post("/init/host", Some(serde_json::to_value(req)?), false, true)
            .await?;
        Ok(())
    }

    /// Upload a stats sample. Strictly fire-and-forget: a single attempt,
    /// failures only logged by the caller.
    pub async fn send_stats(&self, req: &StatsRequest) -> Result<()> {
        self.post("/stats", Some(serde_json::to_value(req)?), false, false)
            .await?;
        Ok(())
    }

    /// Tell the control plane the instance's remote-login daemon is up.
    pub async fn notify_instance_ready(&self, instance_id: &str) -> Result<()> {
        let path = format!("/instances/{}/ready", instance_id);
        self.post(&path, None, false, true).await?;
        info!(instance = instance_id, "instance reported remote-login ready");
        Ok(())
    }

    /// Report a security incident. Best-effort inside lockdown: the caller
    /// logs and proceeds on failure.
    pub async fn report_incident(&self, incident_type: &str, reason: &str) -> Result<()> {
        let payload = IncidentRequest {
            incident_type: incident_type.to_string(),
            reason: reason.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            instances_killed: true,
        };
        if let Err(e) = self
            .post("/incidents", Some(serde_json::to_value(&payload)?), false, true)
            .await
        {
            warn!(error = %e, "incident report failed");
            return Err(e);
        }
        Ok(())
    }
}
