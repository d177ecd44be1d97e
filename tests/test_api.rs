// Admission surface tests: the literal request/response contract served
// over a real TCP listener, with the orchestrator running against the
// scripted host tools.

mod common;

use std::time::Duration;

use common::{AgentFixture, CONTAINER_ID};
use qudata_agent::api;
use qudata_agent::types::InstanceStatus;

struct ApiFixture {
    agent: AgentFixture,
    base: String,
    http: reqwest::Client,
}

impl ApiFixture {
    async fn new() -> Self {
        let agent = AgentFixture::new().await;
        let app = api::router(agent.orchestrator.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            agent,
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create_instance(&self) -> reqwest::Response {
        self.http
            .post(self.url("/instances"))
            .json(&serde_json::json!({
                "image": "ubuntu",
                "image_tag": "22.04",
                "storage_gb": 10,
                "ports": {"22": "2222"},
                "ssh_enabled": false,
                "gpu_count": 1,
            }))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_ping() {
    let fixture = ApiFixture::new().await;
    let resp = fixture
        .http
        .get(fixture.url("/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn test_create_returns_201_with_id_and_ports() {
    let fixture = ApiFixture::new().await;

    let resp = fixture.create_instance().await;
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = resp.json().await.unwrap();
    let instance_id = body["instance_id"].as_str().unwrap();
    assert!(!instance_id.is_empty());
    assert_eq!(body["ports"]["22"], "2222");

    let snap = fixture.agent.store.snapshot().await;
    assert_eq!(snap.status, InstanceStatus::Running);
    assert_eq!(snap.container_id, CONTAINER_ID);
    assert_eq!(snap.pci_address.as_deref(), Some("01:00.0"));
}

#[tokio::test]
async fn test_second_create_returns_500_already_running() {
    let fixture = ApiFixture::new().await;
    assert_eq!(fixture.create_instance().await.status(), 201);

    let resp = fixture.create_instance().await;
    assert_eq!(resp.status(), 500);
    assert!(resp.text().await.unwrap().contains("already_running"));
}

#[tokio::test]
async fn test_create_failure_returns_500_with_cause() {
    let fixture = ApiFixture::new().await;
    fixture.agent.runner.fail_on("docker pull");

    let resp = fixture.create_instance().await;
    assert_eq!(resp.status(), 500);
    assert!(resp.text().await.unwrap().contains("failed to run container"));
    assert_eq!(
        fixture.agent.store.snapshot().await.status,
        InstanceStatus::Destroyed
    );
}

#[tokio::test]
async fn test_delete_returns_202_and_tears_down_async() {
    let fixture = ApiFixture::new().await;
    fixture.create_instance().await;

    let resp = fixture
        .http
        .delete(fixture.url("/instances"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Instance deletion started");

    // Teardown is asynchronous; wait for it to land.
    for _ in 0..100 {
        if fixture.agent.store.snapshot().await.status == InstanceStatus::Destroyed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        fixture.agent.store.snapshot().await.status,
        InstanceStatus::Destroyed
    );
    assert!(!fixture.agent.state_file().exists());
}

#[tokio::test]
async fn test_manage_lifecycle_over_http() {
    let fixture = ApiFixture::new().await;
    fixture.create_instance().await;

    let stop = fixture
        .http
        .put(fixture.url("/instances"))
        .json(&serde_json::json!({"action": "stop"}))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 200);
    assert_eq!(
        fixture.agent.store.snapshot().await.status,
        InstanceStatus::Paused
    );

    let start = fixture
        .http
        .put(fixture.url("/instances"))
        .json(&serde_json::json!({"action": "start"}))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 200);
    assert_eq!(
        fixture.agent.store.snapshot().await.status,
        InstanceStatus::Running
    );

    // start on a running instance is a 500
    let again = fixture
        .http
        .put(fixture.url("/instances"))
        .json(&serde_json::json!({"action": "start"}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 500);
}

#[tokio::test]
async fn test_logs_endpoint_returns_tail_text() {
    let fixture = ApiFixture::new().await;
    fixture.create_instance().await;

    let resp = fixture
        .http
        .get(fixture.url("/instances/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("line one"));
}

#[tokio::test]
async fn test_ssh_endpoints() {
    let fixture = ApiFixture::new().await;
    fixture.create_instance().await;

    let add = fixture
        .http
        .post(fixture.url("/ssh"))
        .json(&serde_json::json!({"public_key": "ssh-ed25519 AAAA t@h"}))
        .send()
        .await
        .unwrap();
    assert_eq!(add.status(), 200);

    let missing_key = fixture
        .http
        .post(fixture.url("/ssh"))
        .json(&serde_json::json!({"public_key": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_key.status(), 400);

    *fixture.agent.runner.exec_output.lock().unwrap() = "ssh-ed25519 AAAA t@h".to_string();
    let list = fixture
        .http
        .get(fixture.url("/ssh"))
        .send()
        .await
        .unwrap();
    assert_eq!(list.status(), 200);
    let body: serde_json::Value = list.json().await.unwrap();
    assert_eq!(body["keys"][0], "ssh-ed25519 AAAA t@h");

    let remove = fixture
        .http
        .delete(fixture.url("/ssh"))
        .json(&serde_json::json!({"public_key": "ssh-ed25519 AAAA t@h"}))
        .send()
        .await
        .unwrap();
    assert_eq!(remove.status(), 200);
}
