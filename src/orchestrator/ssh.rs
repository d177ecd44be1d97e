//! Guest-side SSH key management and the post-create remote-login
//! installer. Everything here runs through `docker exec`; failures affect
//! the guest only, never host state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::client::QudataClient;
use crate::command::CommandRunner;
use crate::container::{short_id, ContainerDriver};

const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

pub async fn add_key(
    driver: &ContainerDriver<'_>,
    container_id: &str,
    public_key: &str,
) -> Result<()> {
    if !public_key.starts_with("ssh-") {
        bail!("invalid public key format");
    }

    let cmd = format!(
        "mkdir -p /root/.ssh && touch {file} && grep -q -F '{key}' {file} || echo '{key}' >> {file}",
        file = AUTHORIZED_KEYS,
        key = public_key,
    );
    driver.exec(container_id, &["sh", "-c", &cmd]).await?;
    Ok(())
}

pub async fn remove_key(
    driver: &ContainerDriver<'_>,
    container_id: &str,
    public_key: &str,
) -> Result<()> {
    if !public_key.starts_with("ssh-") {
        bail!("invalid public key format");
    }

    let escaped = public_key.replace('/', "\\/");
    let cmd = format!("sed -i '/^{}$/d' {}", escaped, AUTHORIZED_KEYS);
    driver.exec(container_id, &["sh", "-c", &cmd]).await?;
    Ok(())
}

pub async fn list_keys(driver: &ContainerDriver<'_>, container_id: &str) -> Result<Vec<String>> {
    // A missing authorized_keys file means no keys, not a failure.
    let output = match driver.exec(container_id, &["cat", AUTHORIZED_KEYS]).await {
        Ok(out) => out,
        Err(_) => return Ok(Vec::new()),
    };

    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Install and start the remote-login daemon in the guest, then tell the
/// control plane the instance is reachable. Detached from create; every
/// failure is surfaced in the log only.
pub fn spawn_remote_login_installer(
    runner: Arc<dyn CommandRunner>,
    client: Option<Arc<QudataClient>>,
    instance_id: String,
    container_id: String,
) {
    tokio::spawn(async move {
        info!(container = %short_id(&container_id), "starting SSH setup in container");
        tokio::time::sleep(Duration::from_secs(5)).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let driver = ContainerDriver::new(runner.as_ref(), &cancel);

        let setup_commands: &[&[&str]] = &[
            &["apt-get", "update", "-qq"],
            &[
                "sh",
                "-c",
                "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq openssh-server",
            ],
            &["mkdir", "-p", "/var/run/sshd"],
            &[
                "sed",
                "-i",
                "s/#PermitRootLogin prohibit-password/PermitRootLogin prohibit-password/",
                "/etc/ssh/sshd_config",
            ],
            &[
                "sed",
                "-i",
                "s/PermitRootLogin yes/PermitRootLogin prohibit-password/",
                "/etc/ssh/sshd_config",
            ],
            &["mkdir", "-p", "/root/.ssh"],
            &["chmod", "700", "/root/.ssh"],
            &["touch", AUTHORIZED_KEYS],
            &["chmod", "600", AUTHORIZED_KEYS],
        ];

        for cmd in setup_commands {
            if let Err(e) = driver.exec(&container_id, cmd).await {
                warn!(container = %short_id(&container_id), error = %e,
                    "SSH setup command failed");
            }
        }

        if let Err(e) = driver
            .exec_detached(&container_id, &["/usr/sbin/sshd", "-D"])
            .await
        {
            warn!(container = %short_id(&container_id), error = %e,
                "failed to start SSH daemon");
            return;
        }
        info!(container = %short_id(&container_id), "SSH daemon started");

        if let Some(client) = client {
            if let Err(e) = client.notify_instance_ready(&instance_id).await {
                warn!(instance = %instance_id, error = %e,
                    "failed to notify control plane of SSH readiness");
            }
        }
    });
}
