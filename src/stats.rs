//! Host stats sampler. CPU/RAM/network come from sysinfo; GPU utilization
//! is queried through nvidia-smi (a host without one just reports zero).
//! Uploads are strictly fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{CpuExt, NetworkExt, NetworksExt, System, SystemExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::QudataClient;
use crate::command::{run_cancellable, CommandRunner};
use crate::state::StateStore;
use crate::types::StatsRequest;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

pub struct StatsCollector {
    sys: System,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl StatsCollector {
    pub fn new(runner: Arc<dyn CommandRunner>, cancel: CancellationToken) -> Self {
        Self {
            sys: System::new(),
            runner,
            cancel,
        }
    }

    pub async fn collect(&mut self) -> StatsRequest {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_networks_list();

        let cpu_util = self.sys.global_cpu_info().cpu_usage() as f64;
        let ram_util = if self.sys.total_memory() > 0 {
            self.sys.used_memory() as f64 / self.sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let (inet_in, inet_out) = self
            .sys
            .networks()
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        StatsRequest {
            gpu_util: self.query_gpu("utilization.gpu").await,
            cpu_util,
            ram_util,
            mem_util: self.query_gpu("utilization.memory").await,
            inet_in,
            inet_out,
            status: crate::types::InstanceStatus::Destroyed,
        }
    }

    /// Single-value nvidia-smi query; hosts without a GPU report 0.
    async fn query_gpu(&self, field: &str) -> f64 {
        let query = format!("--query-gpu={}", field);
        match run_cancellable(
            self.runner.as_ref(),
            &self.cancel,
            None,
            &["nvidia-smi", &query, "--format=csv,noheader,nounits"],
        )
        .await
        {
            Ok(output) => output.lines().next().unwrap_or("").trim().parse().unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}

/// Background sampler: every 10 s collect a sample, stamp it with the
/// current instance status, and upload it. Failures are logged and dropped.
pub fn spawn_sampler(
    client: Arc<QudataClient>,
    store: Arc<StateStore>,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut collector = StatsCollector::new(runner, cancel.clone());
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let mut sample = collector.collect().await;
                    sample.status = store.snapshot().await.status;
                    match client.send_stats(&sample).await {
                        Ok(()) => debug!(cpu = sample.cpu_util, ram = sample.ram_util, "stats uploaded"),
                        Err(e) => warn!("stats send error: {}", e),
                    }
                }
            }
        }
    });
}
