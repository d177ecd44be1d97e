//! Host-firewall driver: cuts the tenant container off from the host's
//! private networks with REJECT rules at the head of the DOCKER-USER chain.

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{run_cancellable, CommandRunner};

const FILTER_CHAIN: &str = "DOCKER-USER";

/// Well-known private ranges the tenant must not reach.
const PRIVATE_NETWORKS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

pub struct FirewallDriver<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
}

impl<'a> FirewallDriver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cancel: &'a CancellationToken) -> Self {
        Self { runner, cancel }
    }

    /// Insert REJECT rules for the container IP. Idempotent: rules that
    /// already exist are fine.
    pub async fn isolate(&self, container_ip: &str) -> Result<()> {
        if container_ip.is_empty() {
            bail!("cannot apply network isolation for an empty IP");
        }

        for network in PRIVATE_NETWORKS {
            let argv = [
                "iptables", "-I", FILTER_CHAIN, "-s", container_ip, "-d", network, "-j", "REJECT",
            ];
            if let Err(e) = run_cancellable(self.runner, self.cancel, None, &argv).await {
                if !e.to_string().contains("rule already exists") {
                    return Err(e);
                }
            }
        }

        info!(ip = container_ip, "network isolation applied");
        Ok(())
    }

    /// Delete the REJECT rules for the container IP. Idempotent: missing
    /// rules are logged and skipped.
    pub async fn deisolate(&self, container_ip: &str) -> Result<()> {
        if container_ip.is_empty() {
            return Ok(());
        }

        for network in PRIVATE_NETWORKS {
            let argv = [
                "iptables", "-D", FILTER_CHAIN, "-s", container_ip, "-d", network, "-j", "REJECT",
            ];
            if let Err(e) = run_cancellable(self.runner, self.cancel, None, &argv).await {
                if !e.to_string().contains("does not exist") {
                    warn!(ip = container_ip, network, error = %e, "failed to remove isolation rule");
                }
            }
        }

        info!(ip = container_ip, "network isolation removed");
        Ok(())
    }
}
