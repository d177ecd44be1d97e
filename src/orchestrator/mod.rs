//! Instance lifecycle orchestrator.
//!
//! Composes the resource drivers into the singleton-instance state machine.
//! Every lifecycle operation serializes on one mutex; create is
//! transactional with reverse-order compensation, destroy is best-effort
//! except for the final state clear.

mod ssh;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::QudataClient;
use crate::command::CommandRunner;
use crate::container::{self, ContainerDriver, ContainerRunSpec};
use crate::gpu::GpuDriver;
use crate::network::FirewallDriver;
use crate::paths::Layout;
use crate::state::StateStore;
use crate::types::{CreateInstanceRequest, InstanceAction, InstanceState, InstanceStatus};
use crate::volume::VolumeDriver;

/// VFIO control node every passthrough guest needs in addition to its
/// per-group device node.
const VFIO_CONTROL_NODE: &str = "/dev/vfio/vfio";

const STOP_TIMEOUT_SECS: u32 = 10;
const LOG_TAIL_LINES: u32 = 100;

pub struct Orchestrator {
    store: Arc<StateStore>,
    runner: Arc<dyn CommandRunner>,
    client: Option<Arc<QudataClient>>,
    layout: Layout,
    cancel: CancellationToken,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        runner: Arc<dyn CommandRunner>,
        client: Option<Arc<QudataClient>>,
        layout: Layout,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            runner,
            client,
            layout,
            cancel,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn volume(&self) -> VolumeDriver<'_> {
        VolumeDriver::new(self.runner.as_ref(), &self.cancel)
    }

    fn gpu(&self) -> GpuDriver<'_> {
        GpuDriver::new(self.runner.as_ref(), &self.cancel)
    }

    fn container(&self) -> ContainerDriver<'_> {
        ContainerDriver::new(self.runner.as_ref(), &self.cancel)
    }

    fn firewall(&self) -> FirewallDriver<'_> {
        FirewallDriver::new(self.runner.as_ref(), &self.cancel)
    }

    /// Create the singleton instance. Each step persists its progress; any
    /// failure unwinds the completed steps in reverse order and leaves the
    /// persisted status destroyed.
    pub async fn create_instance(&self, req: CreateInstanceRequest) -> Result<InstanceState> {
        let _guard = self.lifecycle.lock().await;

        let current = self.store.snapshot().await;
        if !current.status.is_gone() {
            bail!(
                "already_running: instance '{}' is active",
                current.instance_id
            );
        }

        tokio::fs::create_dir_all(&self.layout.storage_dir)
            .await
            .context("creating storage directory")?;
        tokio::fs::create_dir_all(&self.layout.mount_dir)
            .await
            .context("creating mounts directory")?;

        // Step 1: allocate identity and derived paths, persist as pending.
        let instance_id = Uuid::new_v4().to_string();
        let mut state = InstanceState {
            instance_id: instance_id.clone(),
            container_id: String::new(),
            status: InstanceStatus::Pending,
            image_path: self.layout.image_path(&instance_id),
            mapper_name: Layout::mapper_name(&instance_id),
            mount_point: self.layout.mount_point(&instance_id),
            ports: req.ports.clone(),
            pci_address: None,
            original_driver: None,
            vfio_device_path: None,
        };
        if let Err(e) = self.store.save(&state).await {
            let _ = self.store.clear().await;
            return Err(e).context("persisting pending instance");
        }

        info!(instance = %instance_id, image = %req.image, "creating instance");

        // Step 2: GPU passthrough.
        if req.gpu_count > 0 {
            match self.gpu().prepare().await {
                Ok(dev) => {
                    state.pci_address = Some(dev.pci_address);
                    state.original_driver = Some(dev.original_driver);
                    state.vfio_device_path = Some(dev.vfio_device_path);
                    if let Err(e) = self.store.save(&state).await {
                        self.unwind_create(&state, None, false).await;
                        return Err(e).context("persisting GPU assignment");
                    }
                }
                Err(e) => {
                    let _ = self.store.clear().await;
                    return Err(e).context("failed to prepare GPU for passthrough");
                }
            }
        }

        // Step 3: encrypted volume.
        if let Err(e) = self
            .volume()
            .create(
                &state.image_path,
                &state.mapper_name,
                &state.mount_point,
                req.storage_gb,
            )
            .await
        {
            self.unwind_create(&state, None, false).await;
            return Err(e).context("failed to create encrypted volume");
        }

        // Step 4: sandboxed container.
        let spec = ContainerRunSpec {
            image: format!("{}:{}", req.image, req.image_tag),
            env: req.env_variables.clone(),
            ports: req.ports.clone(),
            mount_point: state.mount_point.clone(),
            devices: match &state.vfio_device_path {
                Some(group_node) => vec![VFIO_CONTROL_NODE.to_string(), group_node.clone()],
                None => Vec::new(),
            },
            runtime: container::select_runtime(req.is_confidential),
        };
        match self.container().run(&spec).await {
            Ok(id) => {
                state.container_id = id;
                if let Err(e) = self.store.save(&state).await {
                    self.unwind_create(&state, None, true).await;
                    return Err(e).context("persisting container handle");
                }
            }
            Err(e) => {
                self.unwind_create(&state, None, true).await;
                return Err(e).context("failed to run container");
            }
        }

        // Step 5: network isolation, keyed on the container's primary IP.
        let container_ip = match self.container().inspect(&state.container_id).await {
            Ok(info) => match info.primary_ip {
                Some(ip) => ip,
                None => {
                    self.unwind_create(&state, None, true).await;
                    bail!(
                        "no IP address found for container {}",
                        container::short_id(&state.container_id)
                    );
                }
            },
            Err(e) => {
                self.unwind_create(&state, None, true).await;
                return Err(e).context("failed to get container IP for network isolation");
            }
        };
        if let Err(e) = self.firewall().isolate(&container_ip).await {
            self.unwind_create(&state, None, true).await;
            return Err(e).context("failed to apply network isolation");
        }

        // Step 6: flip to running and persist.
        state.status = InstanceStatus::Running;
        if let Err(e) = self.store.save(&state).await {
            self.unwind_create(&state, Some(&container_ip), true).await;
            return Err(e).context("CRITICAL: failed to save state after instance creation");
        }

        // Step 7: optional remote-login installer, detached.
        if req.ssh_enabled {
            ssh::spawn_remote_login_installer(
                self.runner.clone(),
                self.client.clone(),
                state.instance_id.clone(),
                state.container_id.clone(),
            );
        }

        info!(instance = %state.instance_id, container = %container::short_id(&state.container_id),
            "instance running");
        Ok(state)
    }

    /// Undo the completed create steps in reverse order and reset the
    /// persisted record to destroyed.
    async fn unwind_create(
        &self,
        state: &InstanceState,
        isolated_ip: Option<&str>,
        volume_created: bool,
    ) {
        warn!(instance = %state.instance_id, "rolling back instance creation");

        if let Some(ip) = isolated_ip {
            if let Err(e) = self.firewall().deisolate(ip).await {
                warn!(error = %e, "rollback: failed to remove network isolation");
            }
        }
        if !state.container_id.is_empty() {
            if let Err(e) = self.container().remove(&state.container_id, true).await {
                warn!(error = %e, "rollback: failed to remove container");
            }
        }
        if volume_created {
            self.volume()
                .destroy(&state.image_path, &state.mapper_name, &state.mount_point)
                .await;
        }
        if let (Some(addr), Some(driver)) = (&state.pci_address, &state.original_driver) {
            self.gpu().return_to_host(addr, driver).await;
        }
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "rollback: failed to clear persisted state");
        }
    }

    /// Destroy the instance. Idempotent: a destroyed record is success.
    /// Every teardown sub-step is best-effort; only a failed state clear is
    /// returned so the caller can retry.
    pub async fn destroy_instance(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.destroy_locked().await
    }

    async fn destroy_locked(&self) -> Result<()> {
        let mut current = self.store.snapshot().await;
        if current.status.is_gone() {
            return Ok(());
        }

        info!(instance = %current.instance_id, "destroying instance");
        current.status = InstanceStatus::Destroying;
        if let Err(e) = self.store.save(&current).await {
            warn!(error = %e, "could not persist destroying status");
        }

        let container_ip = if current.container_id.is_empty() {
            None
        } else {
            match self.container().inspect(&current.container_id).await {
                Ok(info) => info.primary_ip,
                Err(e) => {
                    warn!(error = %e, "could not get container IP for cleanup");
                    None
                }
            }
        };

        if let Err(e) = self.container().remove(&current.container_id, true).await {
            warn!(error = %e, "failed to remove container during deletion");
        }

        if let Some(ip) = container_ip {
            if let Err(e) = self.firewall().deisolate(&ip).await {
                warn!(error = %e, "failed to remove network isolation");
            }
        }

        if let (Some(addr), Some(driver)) = (&current.pci_address, &current.original_driver) {
            self.gpu().return_to_host(addr, driver).await;
        }

        self.volume()
            .destroy(&current.image_path, &current.mapper_name, &current.mount_point)
            .await;

        self.store.clear().await.context("clearing instance state")
    }

    /// Start, stop, or restart the tenant container.
    pub async fn manage_instance(&self, action: InstanceAction) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let mut current = self.store.snapshot().await;
        if current.status.is_gone() || current.container_id.is_empty() {
            bail!("no active instance to manage");
        }

        let new_status = match action {
            InstanceAction::Start => {
                if current.status != InstanceStatus::Paused {
                    bail!(
                        "instance is not stopped, current status: {:?}",
                        current.status
                    );
                }
                self.container().start(&current.container_id).await?;
                InstanceStatus::Running
            }
            InstanceAction::Stop => {
                self.container()
                    .stop(&current.container_id, STOP_TIMEOUT_SECS)
                    .await?;
                InstanceStatus::Paused
            }
            InstanceAction::Restart => {
                self.container()
                    .restart(&current.container_id, STOP_TIMEOUT_SECS)
                    .await?;
                InstanceStatus::Running
            }
        };

        if new_status != current.status {
            current.status = new_status;
            self.store
                .save(&current)
                .await
                .with_context(|| format!("saving state after action '{}'", action))?;
        }
        Ok(())
    }

    pub async fn add_ssh_key(&self, public_key: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let container_id = self.require_running().await?;
        ssh::add_key(&self.container(), &container_id, public_key).await
    }

    pub async fn remove_ssh_key(&self, public_key: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let container_id = self.require_running().await?;
        ssh::remove_key(&self.container(), &container_id, public_key).await
    }

    pub async fn list_ssh_keys(&self) -> Result<Vec<String>> {
        let _guard = self.lifecycle.lock().await;
        let container_id = self.require_running().await?;
        ssh::list_keys(&self.container(), &container_id).await
    }

    async fn require_running(&self) -> Result<String> {
        let current = self.store.snapshot().await;
        if current.status != InstanceStatus::Running || current.container_id.is_empty() {
            bail!("no active instance");
        }
        Ok(current.container_id)
    }

    /// Reconcile the persisted record against the container engine. Called
    /// once at startup; a record whose container has vanished is torn down
    /// through the same chain as destroy.
    pub async fn sync_state(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let mut current = self.store.snapshot().await;
        if current.status.is_gone() || current.container_id.is_empty() {
            return Ok(());
        }

        info!("SyncState: syncing agent state with container engine");

        let inspect = match self.container().inspect(&current.container_id).await {
            Ok(info) => info,
            Err(e) if container::is_not_found(&e) => {
                warn!(
                    "SyncState: container {} not found, tearing down stale instance",
                    container::short_id(&current.container_id)
                );
                return self.destroy_locked().await;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "SyncState: failed to inspect container {}",
                        container::short_id(&current.container_id)
                    )
                })
            }
        };

        let reconciled = match inspect.status.as_str() {
            "running" => Some(InstanceStatus::Running),
            "exited" | "dead" | "paused" => Some(InstanceStatus::Paused),
            _ => None,
        };

        if let Some(status) = reconciled {
            if status != current.status {
                info!(
                    "SyncState: state mismatch (engine '{}'), updating agent state to {:?}",
                    inspect.status, status
                );
                current.status = status;
                return self.store.save(&current).await;
            }
        }

        info!("SyncState: state is consistent");
        Ok(())
    }

    /// Tail of the instance's combined stdout/stderr.
    pub async fn instance_logs(&self) -> Result<String> {
        let current = self.store.snapshot().await;
        if current.status.is_gone() || current.container_id.is_empty() {
            bail!("no active instance");
        }
        self.container()
            .logs(&current.container_id, LOG_TAIL_LINES)
            .await
    }
}
