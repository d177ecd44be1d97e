//! Persistent state store: the single-writer record of the at-most-one
//! instance plus the durable agent secret.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use crate::types::{InstanceState, InstanceStatus};

pub struct StateStore {
    state_path: PathBuf,
    secret_path: PathBuf,
    inner: RwLock<InstanceState>,
}

impl StateStore {
    /// Load the store from disk. A missing or malformed record is treated
    /// as destroyed and logged; it is never fatal.
    pub async fn open(state_path: PathBuf, secret_path: PathBuf) -> Self {
        let record = match fs::read(&state_path).await {
            Ok(data) if data.is_empty() => InstanceState::destroyed(),
            Ok(data) => match serde_json::from_slice::<InstanceState>(&data) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %state_path.display(), error = %e,
                        "state file is malformed, treating instance as destroyed");
                    InstanceState::destroyed()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %state_path.display(), error = %e,
                        "could not read state file, treating instance as destroyed");
                }
                InstanceState::destroyed()
            }
        };

        Self {
            state_path,
            secret_path,
            inner: RwLock::new(record),
        }
    }

    /// Return a by-value copy of the current record.
    pub async fn snapshot(&self) -> InstanceState {
        self.inner.read().await.clone()
    }

    /// Atomically persist the record (temp file + rename, owner-only) and
    /// install it in memory. I/O failure here is fatal to the caller: the
    /// orchestrator must abort the transition and roll back.
    pub async fn save(&self, state: &InstanceState) -> Result<()> {
        let mut guard = self.inner.write().await;

        let data = serde_json::to_vec_pretty(state).context("serializing instance state")?;
        let tmp = self.state_path.with_extension("json.tmp");

        fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        set_owner_only(&tmp).await?;
        fs::rename(&tmp, &self.state_path)
            .await
            .with_context(|| format!("renaming into {}", self.state_path.display()))?;

        *guard = state.clone();
        Ok(())
    }

    /// Reset the in-memory record to destroyed and unlink the state file.
    /// A missing file is not an error.
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        *guard = InstanceState::destroyed();

        match fs::remove_file(&self.state_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.state_path.display())),
        }
    }

    pub async fn save_secret(&self, secret: &str) -> Result<()> {
        fs::write(&self.secret_path, secret)
            .await
            .with_context(|| format!("writing {}", self.secret_path.display()))?;
        set_owner_only(&self.secret_path).await
    }

    /// Load the stored secret; an absent file yields None.
    pub async fn load_secret(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.secret_path).await {
            Ok(s) if s.trim().is_empty() => Ok(None),
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.secret_path.display())),
        }
    }

    /// Overwrite the secret with zeros before unlinking it so the bytes do
    /// not survive on disk. Absence is tolerated.
    pub async fn shred_secret(&self) -> Result<()> {
        let len = match fs::metadata(&self.secret_path).await {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("inspecting {}", self.secret_path.display()))
            }
        };

        fs::write(&self.secret_path, vec![0u8; len])
            .await
            .with_context(|| format!("overwriting {}", self.secret_path.display()))?;
        fs::remove_file(&self.secret_path)
            .await
            .with_context(|| format!("unlinking {}", self.secret_path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
async fn set_owner_only(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &PathBuf) -> Result<()> {
    Ok(())
}
