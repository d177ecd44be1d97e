use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use qudata_agent::attestation;
use qudata_agent::cli::Cli;
use qudata_agent::client::QudataClient;
use qudata_agent::command::{run_cancellable, CommandRunner, HostRunner};
use qudata_agent::config::{self, Config};
use qudata_agent::orchestrator::Orchestrator;
use qudata_agent::paths::{self, Layout};
use qudata_agent::security::lockdown::LockdownHandle;
use qudata_agent::security::{watchdog, AgentLockdown, SecurityMonitor};
use qudata_agent::state::StateStore;
use qudata_agent::types::InitAgentRequest;
use qudata_agent::{api, stats};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .init();

    let result = if config::is_watchdog_child() {
        run_watchdog_child().await
    } else {
        run_main_agent().await
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    result
}

/// Child branch: build our own collaborator set from disk and watch the
/// parent's heartbeat. If the parent is killed hard, this process seals
/// the host.
async fn run_watchdog_child() -> Result<()> {
    if paths::lockdown_marker().exists() {
        info!("[Watchdog] host is already sealed, child exiting");
        return Ok(());
    }

    let cfg = Config::from_env(8080).context("[Watchdog] config error")?;

    let store = Arc::new(StateStore::open(paths::state_file(), paths::secret_file()).await);
    let secret = store.load_secret().await.unwrap_or(None);
    let client = Arc::new(
        QudataClient::new(cfg.api_key, secret).context("[Watchdog] client error")?,
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        runner,
        Some(client.clone()),
        Layout::from_base(&paths::base_dir()),
        cancel,
    ));

    let lockdown = LockdownHandle::new(
        Arc::new(AgentLockdown {
            orchestrator,
            client,
        }),
        store,
        paths::lockdown_marker(),
    );

    watchdog::run_as_child(lockdown).await
}

async fn run_main_agent() -> Result<()> {
    let cli = Cli::parse();
    info!(">>> QuData Agent starting...");

    if let Some(dir) = &cli.base_dir {
        paths::set_base_dir(dir.clone());
        // The watchdog child is a re-exec without CLI args; hand the
        // override down through the environment it inherits.
        std::env::set_var("QUDATA_BASE_DIR", dir);
    }

    // A sealed host never resumes orchestration.
    if paths::lockdown_marker().exists() {
        anyhow::bail!(
            "lockdown marker {} exists, refusing to start",
            paths::lockdown_marker().display()
        );
    }

    let cancel = CancellationToken::new();

    // 1. Watchdog first: tamper-kill resistance before anything else runs.
    watchdog::start(&cancel).context("watchdog failed")?;

    // 2. Configuration and state.
    let cfg = Config::from_env(cli.port).context("config error")?;
    tokio::fs::create_dir_all(paths::base_dir())
        .await
        .context("creating agent base directory")?;

    let store = Arc::new(StateStore::open(paths::state_file(), paths::secret_file()).await);
    info!("state loaded, status: {:?}", store.snapshot().await.status);

    // 3. Control-plane client, resuming any stored secret.
    let secret = store.load_secret().await.context("reading agent secret")?;
    let client = Arc::new(QudataClient::new(cfg.api_key.clone(), secret).context("client error")?);

    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);

    // An unreachable container engine is a bootstrap failure, not something
    // to discover on the first create request.
    run_cancellable(
        runner.as_ref(),
        &cancel,
        None,
        &["docker", "version", "--format", "{{.Server.Version}}"],
    )
    .await
    .context("cannot connect to container engine")?;

    // 4. Hardware report and registration.
    let report = attestation::generate_host_report(runner.clone(), &cancel).await;
    let init_req = InitAgentRequest {
        agent_id: Uuid::new_v4().to_string(),
        agent_port: cfg.port,
        address: outbound_ip(),
        fingerprint: report.fingerprint.clone(),
        pid: std::process::id(),
    };

    info!("registering agent...");
    let agent_resp = client
        .init_agent(&init_req)
        .await
        .context("agent registration failed")?;

    if !agent_resp.secret_key.is_empty() {
        store
            .save_secret(&agent_resp.secret_key)
            .await
            .context("saving agent secret")?;
        client.update_secret(&agent_resp.secret_key).await;
        info!("secret key updated");
    }

    if !agent_resp.host_exists {
        info!("registering new host hardware...");
        client
            .create_host(&report.to_create_host_request())
            .await
            .context("host registration failed")?;
    }

    // 5. Orchestrator, reconciled against the container engine.
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        runner.clone(),
        Some(client.clone()),
        Layout::from_base(&paths::base_dir()),
        cancel.clone(),
    ));
    if let Err(e) = orchestrator.sync_state().await {
        warn!("state sync failed: {:#}", e);
    }

    // 6. Security supervisor.
    let lockdown = LockdownHandle::new(
        Arc::new(AgentLockdown {
            orchestrator: orchestrator.clone(),
            client: client.clone(),
        }),
        store.clone(),
        paths::lockdown_marker(),
    );
    let monitor = SecurityMonitor::new(
        runner.clone(),
        store.clone(),
        lockdown,
        paths::lockdown_marker(),
        paths::authz_socket(),
        cancel.clone(),
    );
    monitor.run().await.context("security monitor failed")?;

    // 7. Stats sampler.
    stats::spawn_sampler(client.clone(), store.clone(), runner.clone(), cancel.clone());

    // 8. Admission API.
    let app = api::router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind admission port")?;
    info!(">>> AGENT IS READY, admission API listening on {}", addr);

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }

            // Stop heartbeat and unblock every kernel-event reader, then
            // give in-flight requests a bounded drain window.
            shutdown_cancel.cancel();
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                warn!("drain deadline reached, forcing exit");
                std::process::exit(0);
            });
        })
        .await
        .context("admission server error")?;

    monitor.stop().await;
    info!("goodbye");
    Ok(())
}

/// The address the control plane should reach this agent at.
fn outbound_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
