use anyhow::{bail, Result};

/// Environment variable set by the parent on the watchdog child re-exec.
pub const WATCHDOG_CHILD_ENV: &str = "QUDATA_WATCHDOG_CHILD";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment. A missing API key is a
    /// bootstrap failure; the process must exit before any listener binds.
    pub fn from_env(port: u16) -> Result<Self> {
        let api_key = match std::env::var("QUDATA_API_KEY") {
            Ok(k) if !k.is_empty() => k,
            _ => bail!("QUDATA_API_KEY is required"),
        };

        Ok(Self { api_key, port })
    }
}

/// True when this process was re-exec'd as the watchdog child.
pub fn is_watchdog_child() -> bool {
    std::env::var(WATCHDOG_CHILD_ENV).as_deref() == Ok("1")
}
