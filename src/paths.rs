use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Pin the base directory from the `--base-dir` flag. Must run before the
/// first [`base_dir`] call; a later call loses to whatever is already
/// resolved.
pub fn set_base_dir(path: PathBuf) {
    let _ = BASE_DIR.set(path);
}

/// Base directory for all agent data.
/// Defaults to `/var/lib/qudata` but can be overridden with `--base-dir`
/// or `QUDATA_BASE_DIR`.
pub fn base_dir() -> PathBuf {
    BASE_DIR
        .get_or_init(|| {
            let default = "/var/lib/qudata".to_string();
            let configured = std::env::var("QUDATA_BASE_DIR").unwrap_or(default);
            PathBuf::from(shellexpand::tilde(&configured).as_ref())
        })
        .clone()
}

/// Path to the persisted instance record
pub fn state_file() -> PathBuf {
    base_dir().join("state.json")
}

/// Path to the agent secret
pub fn secret_file() -> PathBuf {
    base_dir().join("secret.key")
}

/// Marker whose presence means the host has been sealed by lockdown
pub fn lockdown_marker() -> PathBuf {
    base_dir().join("lockdown.lock")
}

/// Unix socket the container engine queries for API authorization
pub fn authz_socket() -> PathBuf {
    PathBuf::from("/run/docker/plugins/qudata-authz.sock")
}

/// Per-instance filesystem layout, injected into the orchestrator so tests
/// can point it at a temporary directory.
#[derive(Debug, Clone)]
pub struct Layout {
    pub storage_dir: PathBuf,
    pub mount_dir: PathBuf,
}

impl Layout {
    pub fn from_base(base: &Path) -> Self {
        Self {
            storage_dir: base.join("storage"),
            mount_dir: base.join("mounts"),
        }
    }

    /// Encrypted image file for an instance
    pub fn image_path(&self, instance_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.img", instance_id))
    }

    /// Decrypted-mapper name; a pure function of the instance id so orphan
    /// mappers can be recovered from disk alone.
    pub fn mapper_name(instance_id: &str) -> String {
        format!("qudata-{}", instance_id)
    }

    pub fn mount_point(&self, instance_id: &str) -> PathBuf {
        self.mount_dir.join(instance_id)
    }
}
