//! Encrypted-volume driver: a façade over cryptsetup/LUKS2.
//!
//! The data-encryption key lives only in this process's memory and reaches
//! cryptsetup via stdin. Destroying a volume therefore makes the ciphertext
//! permanently unreadable; that is the data-destruction guarantee.

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{run_cancellable, CommandRunner};

pub struct VolumeDriver<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
}

impl<'a> VolumeDriver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cancel: &'a CancellationToken) -> Self {
        Self { runner, cancel }
    }

    async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String> {
        run_cancellable(self.runner, self.cancel, stdin, argv).await
    }

    /// Create, format, open, and mount an encrypted volume. On any failure
    /// the completed steps are torn down via [`destroy`](Self::destroy) and
    /// the original error is surfaced.
    pub async fn create(
        &self,
        image_path: &Path,
        mapper_name: &str,
        mount_point: &Path,
        size_gb: u64,
    ) -> Result<()> {
        if let Err(e) = self
            .create_inner(image_path, mapper_name, mount_point, size_gb)
            .await
        {
            warn!(mapper = mapper_name, error = %e, "volume creation failed, rolling back");
            self.destroy(image_path, mapper_name, mount_point).await;
            return Err(e);
        }
        Ok(())
    }

    async fn create_inner(
        &self,
        image_path: &Path,
        mapper_name: &str,
        mount_point: &Path,
        size_gb: u64,
    ) -> Result<()> {
        let dek = generate_dek();
        let image = path_str(image_path);
        let mount = path_str(mount_point);
        let size = format!("{}G", size_gb);

        self.run(None, &["truncate", "-s", &size, &image])
            .await
            .context("creating sparse image file")?;

        self.run(
            Some(&dek),
            &["cryptsetup", "luksFormat", "--type", "luks2", &image],
        )
        .await
        .context("luksFormat failed")?;

        self.run(Some(&dek), &["cryptsetup", "luksOpen", &image, mapper_name])
            .await
            .context("luksOpen failed")?;

        let mapper_path = format!("/dev/mapper/{}", mapper_name);

        self.run(None, &["mkfs.ext4", &mapper_path])
            .await
            .context("mkfs.ext4 failed")?;

        tokio::fs::create_dir_all(mount_point)
            .await
            .with_context(|| format!("creating mount point {}", mount))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(mount_point, std::fs::Permissions::from_mode(0o700))
                .await
                .context("restricting mount point permissions")?;
        }

        self.run(None, &["mount", &mapper_path, &mount])
            .await
            .context("mount failed")?;

        info!(image = %image, mapper = mapper_name, "encrypted volume ready");
        Ok(())
    }

    /// Tear the volume down: lazy-unmount, close the mapper, shred the image
    /// file, remove the mount directory. Every step is best-effort; a volume
    /// that never fully came up destroys cleanly.
    pub async fn destroy(&self, image_path: &Path, mapper_name: &str, mount_point: &Path) {
        let image = path_str(image_path);
        let mount = path_str(mount_point);

        if let Err(e) = self.run(None, &["umount", "-l", &mount]).await {
            warn!(mount = %mount, error = %e, "lazy unmount failed");
        }
        if let Err(e) = self.run(None, &["cryptsetup", "luksClose", mapper_name]).await {
            warn!(mapper = mapper_name, error = %e, "luksClose failed");
        }
        if let Err(e) = self
            .run(None, &["shred", "-n", "1", "-z", "-u", &image])
            .await
        {
            warn!(image = %image, error = %e, "shredding image file failed");
        }
        if let Err(e) = tokio::fs::remove_dir(mount_point).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(mount = %mount, error = %e, "removing mount point failed");
            }
        }
    }
}

/// 256-bit data-encryption key from the OS CSRNG, hex-encoded for stdin.
fn generate_dek() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every invocation; fails any argv whose joined form contains
    /// one of the configured triggers.
    struct ScriptedRunner {
        calls: Mutex<Vec<(Option<String>, Vec<String>)>>,
        fail_on: Vec<&'static str>,
    }

    impl ScriptedRunner {
        fn new(fail_on: Vec<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            }
        }

        fn calls(&self) -> Vec<(Option<String>, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String> {
            let joined = argv.join(" ");
            self.calls
                .lock()
                .unwrap()
                .push((stdin.map(String::from), argv.iter().map(|s| s.to_string()).collect()));
            for trigger in &self.fail_on {
                if joined.contains(trigger) {
                    anyhow::bail!("command '{}' failed: exit status: 1; stderr: injected", joined);
                }
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_create_runs_full_protocol_in_order() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(vec![]);
        let cancel = CancellationToken::new();
        let driver = VolumeDriver::new(&runner, &cancel);

        let image = dir.path().join("i.img");
        let mount = dir.path().join("mnt");
        driver
            .create(&image, "qudata-test", &mount, 10)
            .await
            .unwrap();

        let calls = runner.calls();
        let progs: Vec<&str> = calls.iter().map(|(_, a)| a[0].as_str()).collect();
        assert_eq!(
            progs,
            vec!["truncate", "cryptsetup", "cryptsetup", "mkfs.ext4", "mount"]
        );
        assert!(calls[0].1.contains(&"10G".to_string()));
        assert!(mount.is_dir());
    }

    #[tokio::test]
    async fn test_dek_goes_to_stdin_only() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(vec![]);
        let cancel = CancellationToken::new();
        let driver = VolumeDriver::new(&runner, &cancel);

        driver
            .create(&dir.path().join("i.img"), "m", &dir.path().join("mnt"), 1)
            .await
            .unwrap();

        let calls = runner.calls();
        let format_call = &calls[1];
        let open_call = &calls[2];

        let dek = format_call.0.as_ref().expect("luksFormat got no stdin");
        assert_eq!(dek.len(), 64, "DEK must be 32 hex-encoded bytes");
        assert_eq!(open_call.0.as_deref(), Some(dek.as_str()));

        // The key never appears in any argv.
        for (_, argv) in &calls {
            assert!(!argv.iter().any(|a| a == dek));
        }
    }

    #[tokio::test]
    async fn test_failed_format_rolls_back_and_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(vec!["luksFormat"]);
        let cancel = CancellationToken::new();
        let driver = VolumeDriver::new(&runner, &cancel);

        let err = driver
            .create(&dir.path().join("i.img"), "m", &dir.path().join("mnt"), 1)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("luksFormat"));

        // Rollback ran: umount, luksClose and shred were attempted.
        let progs: Vec<String> = runner
            .calls()
            .iter()
            .map(|(_, a)| a.join(" "))
            .collect();
        assert!(progs.iter().any(|c| c.starts_with("umount -l")));
        assert!(progs.iter().any(|c| c.contains("luksClose")));
        assert!(progs.iter().any(|c| c.starts_with("shred")));
    }

    #[tokio::test]
    async fn test_destroy_is_best_effort() {
        let dir = TempDir::new().unwrap();
        // Everything fails; destroy must still try every step and return.
        let runner = ScriptedRunner::new(vec!["umount", "cryptsetup", "shred"]);
        let cancel = CancellationToken::new();
        let driver = VolumeDriver::new(&runner, &cancel);

        driver
            .destroy(&dir.path().join("i.img"), "m", &dir.path().join("mnt"))
            .await;
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_deks_are_unique() {
        assert_ne!(generate_dek(), generate_dek());
    }
}
