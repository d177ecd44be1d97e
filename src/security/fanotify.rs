//! File-access mediator: a fanotify permission gate on the instance's
//! encrypted image file. The kernel blocks each opener until this process
//! answers; only the guest sandbox VMM is allowed through. This is the one
//! mechanism that truly enforces single-user access to the ciphertext.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::security::lockdown::LockdownHandle;

/// A running mediator for one image file.
pub struct FanotifyMediator {
    watch_path: PathBuf,
    cancel: CancellationToken,
}

impl FanotifyMediator {
    pub fn watch_path(&self) -> &Path {
        &self.watch_path
    }

    /// Stop the event loop; its fanotify descriptor is closed when the
    /// loop exits.
    pub fn stop(&self) {
        info!(
            "[Security] stopping fanotify mediator for {}",
            self.watch_path.display()
        );
        self.cancel.cancel();
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::os::fd::AsFd;

    use anyhow::Context;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::fanotify::{
        EventFFlags, Fanotify, FanotifyResponse, InitFlags, MarkFlags, MaskFlags, Response,
    };
    use tracing::error;

    /// Start mediating opens of `path`. Every open attempt is answered
    /// synchronously: allowed iff the opening pid is the sandbox VMM,
    /// denied plus lockdown otherwise.
    pub fn start(
        path: &Path,
        allowed_pid: i32,
        lockdown: LockdownHandle,
        parent_cancel: &CancellationToken,
    ) -> Result<FanotifyMediator> {
        let fan = Fanotify::init(
            InitFlags::FAN_CLASS_CONTENT | InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK,
            EventFFlags::O_RDONLY,
        )
        .context("fanotify init failed")?;

        fan.mark(
            MarkFlags::FAN_MARK_ADD,
            MaskFlags::FAN_OPEN_PERM,
            None::<i32>,
            Some(path),
        )
        .with_context(|| format!("fanotify mark for {} failed", path.display()))?;

        info!(
            "[Security] fanotify mediator started for {} (allowed pid {})",
            path.display(),
            allowed_pid
        );

        let cancel = parent_cancel.child_token();
        let loop_cancel = cancel.clone();
        let watch = path.to_path_buf();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(4);

        tokio::task::spawn_blocking(move || {
            while !loop_cancel.is_cancelled() {
                let mut fds = [PollFd::new(fan.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(500u16)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        error!("[Security] fanotify poll failed: {}", e);
                        return;
                    }
                }

                let events = match fan.read_events() {
                    Ok(events) => events,
                    Err(nix::errno::Errno::EAGAIN) => continue,
                    Err(e) => {
                        error!("[Security] fanotify read failed: {}", e);
                        return;
                    }
                };

                for event in events {
                    if !event.mask().contains(MaskFlags::FAN_OPEN_PERM) {
                        continue;
                    }
                    // The kernel blocks the opener until this response is
                    // written; the event fd closes when `event` drops.
                    let Some(event_fd) = event.fd() else { continue };

                    let verdict = if event.pid() == allowed_pid {
                        Response::FAN_ALLOW
                    } else {
                        Response::FAN_DENY
                    };

                    if let Err(e) = fan.write_response(FanotifyResponse::new(event_fd, verdict)) {
                        error!("[Security] failed to write fanotify response: {}", e);
                    }

                    if verdict == Response::FAN_DENY {
                        let reason = format!(
                            "Denied access to {} for unauthorized PID {}",
                            watch.display(),
                            event.pid()
                        );
                        if tx.blocking_send(reason).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(reason) = rx.recv().await {
                warn!("[Security] !!! SECURITY ALERT [fanotify] !!! {}", reason);
                lockdown.initiate(&reason).await;
            }
        });

        Ok(FanotifyMediator {
            watch_path: path.to_path_buf(),
            cancel,
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn start(
        path: &Path,
        _allowed_pid: i32,
        _lockdown: LockdownHandle,
        parent_cancel: &CancellationToken,
    ) -> Result<FanotifyMediator> {
        warn!("[Security] fanotify mediation not supported on this platform");
        Ok(FanotifyMediator {
            watch_path: path.to_path_buf(),
            cancel: parent_cancel.child_token(),
        })
    }
}

pub use imp::start;
