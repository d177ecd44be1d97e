use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle status of the singleton tenant instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Absent,
    Pending,
    Running,
    Paused,
    Destroying,
    Destroyed,
}

impl InstanceStatus {
    /// A record in this status holds no host resources.
    pub fn is_gone(self) -> bool {
        matches!(self, InstanceStatus::Absent | InstanceStatus::Destroyed)
    }
}

/// The persisted record of the at-most-one tenant instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub container_id: String,
    pub status: InstanceStatus,
    pub image_path: PathBuf,
    pub mapper_name: String,
    pub mount_point: PathBuf,
    pub ports: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfio_device_path: Option<String>,
}

impl InstanceState {
    pub fn destroyed() -> Self {
        Self {
            instance_id: String::new(),
            container_id: String::new(),
            status: InstanceStatus::Destroyed,
            image_path: PathBuf::new(),
            mapper_name: String::new(),
            mount_point: PathBuf::new(),
            ports: HashMap::new(),
            pci_address: None,
            original_driver: None,
            vfio_device_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub image: String,
    pub image_tag: String,
    pub storage_gb: u64,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub ports: HashMap<String, String>,
    #[serde(default)]
    pub ssh_enabled: bool,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub is_confidential: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceAction::Start => write!(f, "start"),
            InstanceAction::Stop => write!(f, "stop"),
            InstanceAction::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ManageInstanceRequest {
    pub action: InstanceAction,
}

// ============================================================================
// Control-plane wire shapes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct InitAgentRequest {
    pub agent_id: String,
    pub agent_port: u16,
    pub address: String,
    pub fingerprint: String,
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub agent_created: bool,
    #[serde(default)]
    pub emergency_reinit: bool,
    #[serde(default)]
    pub host_exists: bool,
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Serialize)]
pub struct CreateHostRequest {
    pub gpu_name: String,
    pub gpu_amount: u32,
    pub vram: f64,
    pub max_cuda: f64,
    pub configuration: HostConfiguration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostConfiguration {
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub ram_gb: f64,
}

#[derive(Debug, Serialize)]
pub struct StatsRequest {
    pub gpu_util: f64,
    pub cpu_util: f64,
    pub ram_util: f64,
    pub mem_util: f64,
    pub inet_in: u64,
    pub inet_out: u64,
    pub status: InstanceStatus,
}

#[derive(Debug, Serialize)]
pub struct IncidentRequest {
    pub incident_type: String,
    pub reason: String,
    pub timestamp: i64,
    pub instances_killed: bool,
}
