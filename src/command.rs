//! Host-tool invocation boundary.
//!
//! Every shell-out the agent performs (cryptsetup, lspci, iptables, docker,
//! pgrep, nvidia-smi, sysfs writes via tee) goes through [`CommandRunner`].
//! Driver tests substitute a scripted implementation; nothing else in the
//! crate spawns processes directly.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, optionally feeding `stdin` to the process, and return
    /// trimmed stdout. Failures carry the tool's stderr verbatim.
    async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String>;
}

/// Production runner backed by `tokio::process::Command`.
pub struct HostRunner;

#[async_trait::async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .context("empty argv passed to command runner")?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning '{}'", program))?;

        if let Some(payload) = stdin {
            let mut pipe = child.stdin.take().context("child stdin missing")?;
            pipe.write_all(payload.as_bytes())
                .await
                .with_context(|| format!("writing stdin to '{}'", program))?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("waiting for '{}'", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "command '{}' failed: {}; stderr: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Run a command but give up as soon as the token is cancelled. Drivers use
/// this so a shutdown does not wait on a wedged host tool.
pub async fn run_cancellable(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    stdin: Option<&str>,
    argv: &[&str],
) -> Result<String> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("command '{}' aborted by shutdown", argv.join(" ")),
        res = runner.run(stdin, argv) => res,
    }
}
