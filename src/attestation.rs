//! Thin hardware-report collaborator. The control plane wants to know what
//! it is renting out; this gathers just enough through the command runner
//! and sysinfo to fill the registration payloads.

use std::sync::Arc;

use sysinfo::{CpuExt, System, SystemExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::command::{run_cancellable, CommandRunner};
use crate::types::{CreateHostRequest, HostConfiguration};

#[derive(Debug, Clone)]
pub struct HostReport {
    pub fingerprint: String,
    pub gpu_name: String,
    pub gpu_amount: u32,
    pub vram_gb: f64,
    pub max_cuda: f64,
    pub configuration: HostConfiguration,
}

impl HostReport {
    pub fn to_create_host_request(&self) -> CreateHostRequest {
        CreateHostRequest {
            gpu_name: self.gpu_name.clone(),
            gpu_amount: self.gpu_amount,
            vram: self.vram_gb,
            max_cuda: self.max_cuda,
            configuration: self.configuration.clone(),
        }
    }
}

pub async fn generate_host_report(
    runner: Arc<dyn CommandRunner>,
    cancel: &CancellationToken,
) -> HostReport {
    let fingerprint = host_fingerprint();

    let (gpu_name, gpu_amount, vram_gb) = match run_cancellable(
        runner.as_ref(),
        cancel,
        None,
        &[
            "nvidia-smi",
            "--query-gpu=name,memory.total",
            "--format=csv,noheader",
        ],
    )
    .await
    {
        Ok(output) => parse_gpu_listing(&output),
        Err(e) => {
            warn!("GPU query failed, reporting a GPU-less host: {}", e);
            (String::new(), 0, 0.0)
        }
    };

    let max_cuda = match run_cancellable(
        runner.as_ref(),
        cancel,
        None,
        &["nvidia-smi", "--query-gpu=compute_cap", "--format=csv,noheader"],
    )
    .await
    {
        Ok(output) => output.lines().next().unwrap_or("").trim().parse().unwrap_or(0.0),
        Err(_) => 0.0,
    };

    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    let configuration = HostConfiguration {
        cpu_model: sys
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_default(),
        cpu_cores: sys.cpus().len(),
        ram_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
    };

    HostReport {
        fingerprint,
        gpu_name,
        gpu_amount,
        vram_gb,
        max_cuda,
        configuration,
    }
}

/// Stable host identity: the machine id, falling back to the hostname.
fn host_fingerprint() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    System::new().host_name().unwrap_or_else(|| "unknown-host".to_string())
}

/// Parse `nvidia-smi --query-gpu=name,memory.total` lines like
/// `NVIDIA GeForce RTX 4090, 24564 MiB` into (name, count, vram GB).
fn parse_gpu_listing(output: &str) -> (String, u32, f64) {
    let mut name = String::new();
    let mut count = 0u32;
    let mut vram_gb = 0.0f64;

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        count += 1;
        let mut parts = line.splitn(2, ',');
        let gpu_name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            name = gpu_name.to_string();
        }
        if let Some(mem) = parts.next() {
            let mib: f64 = mem
                .trim()
                .trim_end_matches("MiB")
                .trim()
                .parse()
                .unwrap_or(0.0);
            if count == 1 {
                vram_gb = mib / 1024.0;
            }
        }
    }

    (name, count, vram_gb)
}
