//! Security supervisor: audit monitor, file-access mediator, API mediator,
//! and the reconciliation loop that keeps the mediator attached to the
//! live instance. Every observer escalates through the same lockdown
//! handle.

pub mod audit;
pub mod authz;
pub mod fanotify;
pub mod lockdown;
pub mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::QudataClient;
use crate::command::{run_cancellable, CommandRunner};
use crate::orchestrator::Orchestrator;
use crate::state::StateStore;
use crate::types::InstanceStatus;

use fanotify::FanotifyMediator;
use lockdown::{LockdownDeps, LockdownHandle};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Production lockdown collaborators: the orchestrator's teardown path and
/// the control-plane incident report.
pub struct AgentLockdown {
    pub orchestrator: Arc<Orchestrator>,
    pub client: Arc<QudataClient>,
}

#[async_trait::async_trait]
impl LockdownDeps for AgentLockdown {
    async fn destroy_instance(&self) -> Result<()> {
        self.orchestrator.destroy_instance().await
    }

    async fn report_incident(&self, incident_type: &str, reason: &str) -> Result<()> {
        self.client.report_incident(incident_type, reason).await
    }
}

pub struct SecurityMonitor {
    runner: Arc<dyn CommandRunner>,
    store: Arc<StateStore>,
    lockdown: LockdownHandle,
    marker: PathBuf,
    authz_socket: PathBuf,
    cancel: CancellationToken,
    mediator: Arc<tokio::sync::Mutex<Option<FanotifyMediator>>>,
}

impl SecurityMonitor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<StateStore>,
        lockdown: LockdownHandle,
        marker: PathBuf,
        authz_socket: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            store,
            lockdown,
            marker,
            authz_socket,
            cancel,
            mediator: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Install audit rules, start the audit consumer and the authz
    /// mediator, and kick off the reconciliation loop. Any failure here is
    /// a bootstrap failure.
    pub async fn run(&self) -> Result<()> {
        info!("[Security] security monitor starting");

        audit::install_rules(self.runner.as_ref(), &self.cancel).await?;
        audit::spawn_listener(self.lockdown.clone(), self.cancel.clone())?;
        authz::spawn_server(&self.authz_socket, self.cancel.clone()).await?;

        let monitor = self.clone_for_loop();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    _ = ticker.tick() => monitor.reconcile().await,
                }
            }
        });

        info!("[Security] security monitor is running");
        Ok(())
    }

    fn clone_for_loop(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            store: self.store.clone(),
            lockdown: self.lockdown.clone(),
            marker: self.marker.clone(),
            authz_socket: self.authz_socket.clone(),
            cancel: self.cancel.clone(),
            mediator: self.mediator.clone(),
        }
    }

    /// One reconciliation tick: attach the file-access mediator to a
    /// running instance, detach it from a stopped one. A sealed host does
    /// not resume orchestration.
    pub async fn reconcile(&self) {
        if self.marker.exists() {
            warn!("[Security] lockdown marker present, skipping reconciliation");
            return;
        }

        let state = self.store.snapshot().await;
        let mut mediator = self.mediator.lock().await;

        if state.status == InstanceStatus::Running && mediator.is_none() {
            info!("[Security] running instance detected, starting file-access mediation");

            let pid = match self
                .find_sandbox_pid(&state.container_id)
                .await
            {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("[Security] could not find sandbox VMM pid: {}, retrying next tick", e);
                    return;
                }
            };

            match fanotify::start(&state.image_path, pid, self.lockdown.clone(), &self.cancel) {
                Ok(m) => *mediator = Some(m),
                Err(e) => warn!("[Security] failed to start file-access mediator: {}", e),
            }
        }

        if state.status != InstanceStatus::Running {
            if let Some(m) = mediator.take() {
                info!("[Security] instance is not running, stopping file-access mediation");
                m.stop();
            }
        }
    }

    /// Resolve the guest VMM process serving this container: the
    /// qemu-system process whose command line mentions the short container
    /// id.
    async fn find_sandbox_pid(&self, container_id: &str) -> Result<i32> {
        if container_id.len() < 12 {
            bail!("container id '{}' is too short", container_id);
        }
        let pattern = format!("qemu-system-.*{}", &container_id[..12]);

        let output = run_cancellable(
            self.runner.as_ref(),
            &self.cancel,
            None,
            &["pgrep", "-f", &pattern],
        )
        .await?;

        output
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<i32>()
            .with_context(|| format!("unparseable pgrep output: {}", output))
    }

    /// Tear the supervisor down on graceful shutdown: the shared token is
    /// already cancelled; delete audit rules and detach the mediator.
    pub async fn stop(&self) {
        info!("[Security] stopping all security modules");

        if let Err(e) = audit::remove_rules(self.runner.as_ref()).await {
            warn!("[Security] failed to delete audit rules: {}", e);
        }

        let mut mediator = self.mediator.lock().await;
        if let Some(m) = mediator.take() {
            m.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakePgrep {
        output: &'static str,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakePgrep {
        async fn run(&self, _stdin: Option<&str>, argv: &[&str]) -> Result<String> {
            self.calls.lock().unwrap().push(argv.join(" "));
            if self.output.is_empty() {
                anyhow::bail!("command 'pgrep' failed: exit status: 1; stderr: ");
            }
            Ok(self.output.to_string())
        }
    }

    struct NoopDeps;

    #[async_trait::async_trait]
    impl LockdownDeps for NoopDeps {
        async fn destroy_instance(&self) -> Result<()> {
            Ok(())
        }
        async fn report_incident(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn monitor_with(runner: Arc<dyn CommandRunner>, dir: &TempDir) -> SecurityMonitor {
        let store = Arc::new(
            StateStore::open(
                dir.path().join("state.json"),
                dir.path().join("secret.key"),
            )
            .await,
        );
        let lockdown = LockdownHandle::new(
            Arc::new(NoopDeps),
            store.clone(),
            dir.path().join("lockdown.lock"),
        );
        SecurityMonitor::new(
            runner,
            store,
            lockdown,
            dir.path().join("lockdown.lock"),
            dir.path().join("authz.sock"),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_find_sandbox_pid_uses_short_container_id() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakePgrep {
            output: "4242\n",
            calls: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(runner.clone(), &dir).await;

        let pid = monitor
            .find_sandbox_pid("f00dfacecafe0123456789ab")
            .await
            .unwrap();
        assert_eq!(pid, 4242);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], "pgrep -f qemu-system-.*f00dfacecafe");
    }

    #[tokio::test]
    async fn test_find_sandbox_pid_rejects_short_id() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakePgrep {
            output: "1\n",
            calls: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(runner, &dir).await;
        assert!(monitor.find_sandbox_pid("short").await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_skips_sealed_host() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakePgrep {
            output: "4242\n",
            calls: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(runner.clone(), &dir).await;

        // Running instance, but the host is sealed: no pid lookup happens.
        let mut state = InstanceState::destroyed();
        state.instance_id = "i".into();
        state.container_id = "f00dfacecafe0123".into();
        state.status = InstanceStatus::Running;
        monitor.store.save(&state).await.unwrap();
        std::fs::write(dir.path().join("lockdown.lock"), b"").unwrap();

        monitor.reconcile().await;
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
