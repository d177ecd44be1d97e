//! Audit monitor: tags every execve of a deny-listed operator tool with a
//! kernel audit rule and consumes the audit event stream. A tagged event
//! is an attack on the tenant and escalates straight to lockdown.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{run_cancellable, CommandRunner};
use crate::security::lockdown::LockdownHandle;

/// Operator tools whose execution means the host is being tampered with:
/// block-device imaging/inspection, raw-memory dumpers, hypervisor CLIs.
pub const FORBIDDEN_COMMANDS: [&str; 5] = [
    "/usr/bin/virsh",
    "/usr/bin/qemu-img",
    "/usr/bin/qemu-io",
    "/usr/bin/pcileech",
    "/usr/bin/memdump",
];

const AUDIT_KEY: &str = "qudata_exec_watch";

/// Install the execve watch rules, replacing any stale ones from a previous
/// run. Failure to install a rule is fatal: the host must not serve tenants
/// unwatched.
pub async fn install_rules(runner: &dyn CommandRunner, cancel: &CancellationToken) -> Result<()> {
    if let Err(e) = run_cancellable(runner, cancel, None, &["auditctl", "-D", "-k", AUDIT_KEY]).await
    {
        warn!("[Security] failed to delete old audit rules: {}", e);
    }

    for path in FORBIDDEN_COMMANDS {
        let path_filter = format!("path={}", path);
        run_cancellable(
            runner,
            cancel,
            None,
            &[
                "auditctl", "-a", "always,exit", "-F", &path_filter, "-F", "perm=x", "-S",
                "execve", "-k", AUDIT_KEY,
            ],
        )
        .await?;
    }

    info!("[Security] audit rules for forbidden commands have been set");
    Ok(())
}

/// Delete the installed rules on shutdown.
pub async fn remove_rules(runner: &dyn CommandRunner) -> Result<()> {
    // Shutdown cancels the shared token, so rule deletion runs on its own.
    let cancel = CancellationToken::new();
    run_cancellable(runner, &cancel, None, &["auditctl", "-D", "-k", AUDIT_KEY]).await?;
    Ok(())
}

/// Extract a quoted `field="value"` from an audit message.
fn audit_field<'a>(payload: &'a str, field: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", field);
    let start = payload.find(&needle)? + needle.len();
    let end = payload[start..].find('"')? + start;
    Some(&payload[start..end])
}

/// Decide whether a SYSCALL audit payload is a tagged execution of a
/// deny-listed tool; returns the offending executable path.
pub fn match_forbidden_exec(payload: &str) -> Option<String> {
    if audit_field(payload, "key")? != AUDIT_KEY {
        return None;
    }
    let exe = audit_field(payload, "exe")?;
    FORBIDDEN_COMMANDS
        .iter()
        .find(|forbidden| exe == **forbidden)
        .map(|_| exe.to_string())
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::os::fd::{AsRawFd, OwnedFd};

    use anyhow::{Context, Result};
    use nix::errno::Errno;
    use nix::sys::socket::{
        bind, recv, setsockopt, socket, sockopt::ReceiveTimeout, AddressFamily, MsgFlags,
        NetlinkAddr, SockFlag, SockProtocol, SockType,
    };
    use nix::sys::time::TimeVal;
    use tracing::error;

    /// Audit message type for syscall records.
    const AUDIT_SYSCALL: u16 = 1300;
    /// Multicast group carrying the kernel audit log.
    const AUDIT_NLGRP_READLOG: u32 = 1;
    /// Netlink message header: the payload text starts after it.
    const NLMSG_HDRLEN: usize = 16;

    /// Open a NETLINK_AUDIT socket subscribed to the kernel log multicast
    /// group, with a 1 s receive timeout so the reader can observe
    /// cancellation.
    fn open_audit_socket() -> Result<OwnedFd> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkAudit,
        )
        .context("creating audit netlink socket")?;

        let addr = NetlinkAddr::new(0, 1 << (AUDIT_NLGRP_READLOG - 1));
        bind(fd.as_raw_fd(), &addr).context("binding audit netlink socket")?;

        setsockopt(&fd, ReceiveTimeout, &TimeVal::new(1, 0))
            .context("setting audit socket receive timeout")?;

        Ok(fd)
    }

    /// Start the audit event consumer. The blocking netlink reader hands
    /// matched executions to an async task that escalates to lockdown.
    pub fn spawn_listener(lockdown: LockdownHandle, cancel: CancellationToken) -> Result<()> {
        let fd = open_audit_socket()?;
        info!("[Security] audit event listener started");

        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(8);

        let reader_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            while !reader_cancel.is_cancelled() {
                let n = match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                    Ok(n) => n,
                    Err(Errno::EAGAIN | Errno::EINTR) => continue,
                    Err(e) => {
                        error!("[Security] audit receive failed: {}", e);
                        return;
                    }
                };
                if n < NLMSG_HDRLEN {
                    continue;
                }

                let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
                if msg_type != AUDIT_SYSCALL {
                    continue;
                }

                let payload = String::from_utf8_lossy(&buf[NLMSG_HDRLEN..n]);
                if let Some(exe) = match_forbidden_exec(&payload) {
                    if tx.blocking_send(exe).is_err() {
                        return;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(exe) = rx.recv().await {
                let reason = format!("Forbidden command executed: {}", exe);
                warn!("[Security] !!! SECURITY ALERT [audit] !!! {}", reason);
                lockdown.initiate(&reason).await;
            }
        });

        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn spawn_listener(_lockdown: LockdownHandle, _cancel: CancellationToken) -> Result<()> {
        warn!("[Security] kernel audit stream not supported on this platform");
        Ok(())
    }
}

pub use imp::spawn_listener;
