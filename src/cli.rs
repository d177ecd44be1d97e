use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "qudata-agent",
    version,
    about = "Host agent for single-tenant confidential GPU instances"
)]
pub struct Cli {
    /// Port for the local admission API
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Base directory for agent data (state, secret, tenant volumes).
    /// Overrides QUDATA_BASE_DIR; defaults to /var/lib/qudata.
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
}
