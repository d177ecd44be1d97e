//! Container driver: a façade over the docker CLI.
//!
//! The instance always runs under a virtualization-based sandbox runtime;
//! [`select_runtime`] picks the confidential-VM variant when requested.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::{run_cancellable, CommandRunner};

pub const RUNTIME_KATA_QEMU: &str = "kata-qemu";
pub const RUNTIME_KATA_CVM: &str = "kata-cvm";

/// Fixed path the encrypted volume is exposed at inside the guest.
pub const GUEST_DATA_PATH: &str = "/data";

pub fn select_runtime(is_confidential: bool) -> &'static str {
    if is_confidential {
        RUNTIME_KATA_CVM
    } else {
        RUNTIME_KATA_QEMU
    }
}

/// Everything needed to start the tenant container.
#[derive(Debug, Clone)]
pub struct ContainerRunSpec {
    /// Image reference, `name:tag`
    pub image: String,
    pub env: HashMap<String, String>,
    /// Port bindings, guest port → host port
    pub ports: HashMap<String, String>,
    /// Host mount point of the decrypted volume
    pub mount_point: PathBuf,
    /// Character devices to expose to the guest VMM (vfio control node and
    /// the per-IOMMU-group node), empty without GPU passthrough
    pub devices: Vec<String>,
    pub runtime: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub status: String,
    pub primary_ip: Option<String>,
}

pub struct ContainerDriver<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
}

impl<'a> ContainerDriver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cancel: &'a CancellationToken) -> Self {
        Self { runner, cancel }
    }

    async fn run_cmd(&self, argv: &[&str]) -> Result<String> {
        run_cancellable(self.runner, self.cancel, None, argv).await
    }

    /// Pull the image, then create and start the container. Returns the
    /// engine's container handle.
    pub async fn run(&self, spec: &ContainerRunSpec) -> Result<String> {
        self.run_cmd(&["docker", "pull", &spec.image])
            .await
            .with_context(|| format!("pulling image {}", spec.image))?;

        let mount_arg = format!("{}:{}", spec.mount_point.display(), GUEST_DATA_PATH);
        let mut argv: Vec<String> = vec![
            "docker".into(),
            "run".into(),
            "-d".into(),
            "--runtime".into(),
            spec.runtime.into(),
            "-v".into(),
            mount_arg,
        ];
        for (guest, host) in &spec.ports {
            argv.push("-p".into());
            argv.push(format!("{}:{}", host, guest));
        }
        for (key, value) in &spec.env {
            argv.push("-e".into());
            argv.push(format!("{}={}", key, value));
        }
        for device in &spec.devices {
            argv.push("--device".into());
            argv.push(device.clone());
        }
        argv.push(spec.image.clone());

        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let container_id = self
            .run_cmd(&argv_refs)
            .await
            .with_context(|| format!("starting container from {}", spec.image))?;
        if container_id.is_empty() {
            bail!("container engine returned an empty container id");
        }

        info!(container = %short_id(&container_id), runtime = spec.runtime, "container started");
        Ok(container_id)
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.run_cmd(&["docker", "start", container_id])
            .await
            .with_context(|| format!("starting container {}", short_id(container_id)))?;
        Ok(())
    }

    pub async fn restart(&self, container_id: &str, timeout_secs: u32) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.run_cmd(&["docker", "restart", "-t", &timeout, container_id])
            .await
            .with_context(|| format!("restarting container {}", short_id(container_id)))?;
        Ok(())
    }

    pub async fn stop(&self, container_id: &str, timeout_secs: u32) -> Result<()> {
        if container_id.is_empty() {
            return Ok(());
        }
        let timeout = timeout_secs.to_string();
        match self
            .run_cmd(&["docker", "stop", "-t", &timeout, container_id])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop (best-effort) and remove the container with its anonymous
    /// volumes. A container that is already gone is not an error.
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        if container_id.is_empty() {
            return Ok(());
        }
        let _ = self.stop(container_id, 10).await;

        let mut argv = vec!["docker", "rm", "-v"];
        if force {
            argv.push("-f");
        }
        argv.push(container_id);
        match self.run_cmd(&argv).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Inspect the container, returning its engine status and primary IP.
    pub async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let raw = self
            .run_cmd(&["docker", "inspect", container_id])
            .await
            .with_context(|| format!("inspecting container {}", short_id(container_id)))?;
        parse_inspect(&raw)
    }

    /// Attached exec: waits for completion; a non-zero exit is an error
    /// carrying the command's stderr.
    pub async fn exec(&self, container_id: &str, argv: &[&str]) -> Result<String> {
        let mut full = vec!["docker", "exec", container_id];
        full.extend_from_slice(argv);
        self.run_cmd(&full).await
    }

    /// Detached exec: returns as soon as the process has started.
    pub async fn exec_detached(&self, container_id: &str, argv: &[&str]) -> Result<()> {
        let mut full = vec!["docker", "exec", "-d", container_id];
        full.extend_from_slice(argv);
        self.run_cmd(&full).await?;
        Ok(())
    }

    /// Combined stdout/stderr tail of the container.
    pub async fn logs(&self, container_id: &str, tail: u32) -> Result<String> {
        let script = format!("docker logs --tail {} {} 2>&1", tail, container_id);
        run_cancellable(self.runner, self.cancel, None, &["sh", "-c", &script]).await
    }
}

/// True when an engine error means the container no longer exists. Checks
/// the whole context chain since driver calls wrap the raw stderr.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err);
    msg.contains("No such container")
        || msg.contains("no such container")
        || msg.contains("No such object")
}

fn parse_inspect(raw: &str) -> Result<ContainerInfo> {
    let parsed: serde_json::Value =
        serde_json::from_str(raw).context("parsing docker inspect output")?;
    let entry = parsed
        .get(0)
        .context("docker inspect returned no entries")?;

    let status = entry
        .pointer("/State/Status")
        .and_then(|v| v.as_str())
        .context("inspect output missing State.Status")?
        .to_string();

    let primary_ip = entry
        .pointer("/NetworkSettings/Networks")
        .and_then(|networks| networks.as_object())
        .and_then(|networks| {
            networks
                .values()
                .filter_map(|n| n.get("IPAddress").and_then(|v| v.as_str()))
                .find(|ip| !ip.is_empty())
                .map(String::from)
        });

    Ok(ContainerInfo { status, primary_ip })
}

/// First 12 characters of a container id, for log lines.
pub fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}
