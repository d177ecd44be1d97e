// API mediator tests over a real unix socket, speaking the same HTTP/1.1
// the container engine's authz plugin transport uses.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use qudata_agent::security::authz;

async fn roundtrip(socket: &std::path::Path, path: &str, body: &str) -> String {
    let mut stream = tokio::net::UnixStream::connect(socket).await.unwrap();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_mediator_over_unix_socket() {
    let dir = tempfile::TempDir::new().unwrap();
    let socket = dir.path().join("qudata-authz.sock");
    let cancel = CancellationToken::new();

    authz::spawn_server(&socket, cancel.clone()).await.unwrap();

    // Activation handshake
    let resp = roundtrip(&socket, "/Plugin.Activate", "{}").await;
    assert!(resp.contains("200 OK"));
    assert!(resp.contains(r#"{"Implements":["authz"]}"#));

    // Forbidden verb in the URI is denied
    let resp = roundtrip(
        &socket,
        "/AuthZPlugin.Allow",
        r#"{"RequestMethod":"POST","RequestUri":"/v1.43/containers/x/exec","User":"root"}"#,
    )
    .await;
    assert!(resp.contains(r#""Allow":false"#));
    assert!(resp.contains("denied by Qudata Agent"));

    // Benign call is allowed
    let resp = roundtrip(
        &socket,
        "/AuthZPlugin.Allow",
        r#"{"RequestMethod":"GET","RequestUri":"/v1.43/containers/json"}"#,
    )
    .await;
    assert!(resp.contains(r#""Allow":true"#));

    cancel.cancel();
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = tempfile::TempDir::new().unwrap();
    let socket = dir.path().join("qudata-authz.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let cancel = CancellationToken::new();
    authz::spawn_server(&socket, cancel.clone()).await.unwrap();

    let resp = roundtrip(&socket, "/Plugin.Activate", "{}").await;
    assert!(resp.contains("200 OK"));
    cancel.cancel();
}

#[test]
fn test_deny_list_is_exhaustive_for_dangerous_verbs() {
    for uri in [
        "/containers/x/exec",
        "/containers/x/attach",
        "/containers/x/copy",
        "/containers/x/archive",
        "/commit",
        "/containers/x/rename",
        "/containers/x/update",
        "/containers/x/kill",
    ] {
        assert!(authz::is_forbidden(uri), "{} should be denied", uri);
    }
}
