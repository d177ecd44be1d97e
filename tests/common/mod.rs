// Common test utilities for qudata-agent integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use qudata_agent::command::CommandRunner;
use qudata_agent::orchestrator::Orchestrator;
use qudata_agent::paths::Layout;
use qudata_agent::state::StateStore;
use tempfile::TempDir;

pub const CONTAINER_ID: &str = "f00dfacecafe0123456789abcdef";

pub const RUNNING_INSPECT: &str = r#"[{
    "State": {"Status": "running"},
    "NetworkSettings": {"Networks": {"bridge": {"IPAddress": "172.17.0.2"}}}
}]"#;

pub const EXITED_INSPECT: &str = r#"[{
    "State": {"Status": "exited"},
    "NetworkSettings": {"Networks": {"bridge": {"IPAddress": ""}}}
}]"#;

/// Simulates every host tool the agent shells out to. Tests inject
/// failures by substring and read back the recorded invocations.
pub struct ScriptedRunner {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<String>>,
    pub inspect_json: Mutex<String>,
    pub container_missing: AtomicBool,
    pub exec_output: Mutex<String>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(Vec::new()),
            inspect_json: Mutex::new(RUNNING_INSPECT.to_string()),
            container_missing: AtomicBool::new(false),
            exec_output: Mutex::new(String::new()),
        }
    }

    pub fn fail_on(&self, trigger: &str) {
        self.fail_on.lock().unwrap().push(trigger.to_string());
    }

    pub fn set_inspect(&self, json: &str) {
        *self.inspect_json.lock().unwrap() = json.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _stdin: Option<&str>, argv: &[&str]) -> Result<String> {
        let joined = argv.join(" ");
        self.calls.lock().unwrap().push(joined.clone());

        for trigger in self.fail_on.lock().unwrap().iter() {
            if joined.contains(trigger) {
                anyhow::bail!(
                    "command '{}' failed: exit status: 1; stderr: injected failure",
                    joined
                );
            }
        }

        if self.container_missing.load(Ordering::SeqCst) {
            if joined.starts_with("docker inspect") {
                anyhow::bail!(
                    "command '{}' failed: exit status: 1; stderr: Error: No such object: {}",
                    joined,
                    CONTAINER_ID
                );
            }
            if joined.starts_with("docker stop") || joined.starts_with("docker rm") {
                anyhow::bail!(
                    "command '{}' failed: exit status: 1; stderr: Error response from daemon: No such container: {}",
                    joined,
                    CONTAINER_ID
                );
            }
        }

        if joined.starts_with("docker run") {
            return Ok(CONTAINER_ID.to_string());
        }
        if joined.starts_with("docker inspect") {
            return Ok(self.inspect_json.lock().unwrap().clone());
        }
        if joined.starts_with("docker exec") {
            return Ok(self.exec_output.lock().unwrap().clone());
        }
        if joined.starts_with("sh -c docker logs") {
            return Ok("line one\nline two".to_string());
        }
        if joined.starts_with("lspci -vmm") {
            return Ok("Slot:\t01:00.0\nClass:\t3D controller\nDriver:\tnvidia\n".to_string());
        }
        if joined.starts_with("lspci -n -s") {
            return Ok("01:00.0 0302: 10de:2204".to_string());
        }
        if joined.starts_with("readlink") {
            return Ok("/sys/kernel/iommu_groups/42".to_string());
        }
        if joined.starts_with("pgrep") {
            return Ok("4242".to_string());
        }
        Ok(String::new())
    }
}

/// A fully wired orchestrator over a temp directory and scripted runner.
pub struct AgentFixture {
    pub dir: TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub store: Arc<StateStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AgentFixture {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let store = Arc::new(
            StateStore::open(
                dir.path().join("state.json"),
                dir.path().join("secret.key"),
            )
            .await,
        );
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            runner.clone(),
            None,
            Layout::from_base(dir.path()),
            CancellationToken::new(),
        ));
        Self {
            dir,
            runner,
            store,
            orchestrator,
        }
    }

    pub fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join("state.json")
    }
}

pub fn create_request(gpu_count: u32) -> qudata_agent::CreateInstanceRequest {
    serde_json::from_value(serde_json::json!({
        "image": "ubuntu",
        "image_tag": "22.04",
        "storage_gb": 10,
        "env_variables": {},
        "ports": {"22": "2222"},
        "ssh_enabled": false,
        "gpu_count": gpu_count,
        "is_confidential": false,
    }))
    .unwrap()
}
