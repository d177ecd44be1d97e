//! Parent/child watchdog. The agent re-execs itself as a child that holds
//! the read end of a pipe; the parent heartbeats a byte every 5 s. If the
//! heartbeat stops or the pipe dies, the child seals the host on its own;
//! killing the agent hard does not stop the lockdown.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WATCHDOG_CHILD_ENV;
use crate::security::lockdown::LockdownHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fork the watchdog child (a re-exec of this binary with the marker env
/// var) and start the heartbeat writer. Called before anything else at
/// startup.
pub fn start(cancel: &CancellationToken) -> Result<()> {
    let exe = std::env::current_exe().context("could not find path to own executable")?;

    let mut child = tokio::process::Command::new(exe)
        .env(WATCHDOG_CHILD_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .context("could not start watchdog child process")?;

    info!("[Watchdog] child process started with PID {:?}", child.id());

    let mut pipe = child
        .stdin
        .take()
        .context("watchdog child has no stdin pipe")?;

    let cancel = cancel.clone();
    tokio::spawn(async move {
        // Holding the child handle keeps the process from being reaped
        // under us; the pipe closing on task exit lets the child react.
        let _child = child;
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Watchdog] heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = pipe.write_all(b".").await {
                        warn!("[Watchdog] failed to ping child process: {}", e);
                        return;
                    }
                }
            }
        }
    });

    Ok(())
}

/// Child entry point: consume heartbeats from stdin under a 15 s deadline.
/// A missed deadline or a dead pipe means the parent was stopped out from
/// under us: execute the lockdown protocol and exit.
pub async fn run_as_child(lockdown: LockdownHandle) -> ! {
    info!("[Watchdog] running as child process, monitoring parent");

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1];

    loop {
        match tokio::time::timeout(HEARTBEAT_TIMEOUT, stdin.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => continue,
            Ok(Ok(_)) => {
                lockdown
                    .initiate("Parent heartbeat pipe closed unexpectedly")
                    .await
            }
            Ok(Err(e)) => {
                let reason = format!("Parent heartbeat pipe read error: {}", e);
                lockdown.initiate(&reason).await
            }
            Err(_) => {
                let reason = format!(
                    "Parent process heartbeat timeout after {:?}",
                    HEARTBEAT_TIMEOUT
                );
                lockdown.initiate(&reason).await
            }
        }
    }
}
