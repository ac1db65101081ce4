//! Registry-level invariants: one live driver per id, and a
//! re-register tearing down whatever was running before it.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use mcp_engine::{HandshakeTimeouts, ServerRegistry, SqlSpecStore};
use mcp_protocol::{ServerSpec, Transport};

fn write_fake_server() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-mcp-server");
    let script = r#"#!/usr/bin/env python3
import json
import sys

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    req_id = msg.get("id")
    if method == "initialize":
        print(json.dumps({"jsonrpc": "2.0", "id": req_id, "result": {}}))
        sys.stdout.flush()
"#;
    std::fs::write(&script_path, script).expect("write script");
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();
    (dir, script_path)
}

async fn registry() -> Arc<ServerRegistry> {
    let store = Arc::new(SqlSpecStore::connect("sqlite::memory:").await.unwrap());
    Arc::new(ServerRegistry::new(store, HandshakeTimeouts::default()))
}

#[tokio::test]
async fn register_then_get_client_returns_a_ready_driver() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    );
    registry.register(spec).await.unwrap();

    let driver = registry.get_client("srv").unwrap();
    assert_eq!(driver.state(), mcp_protocol::DriverState::Ready);
}

#[tokio::test]
async fn registering_the_same_id_twice_leaves_exactly_one_live_driver() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    );
    registry.register(spec.clone()).await.unwrap();
    let first = registry.get_client("srv").unwrap();
    registry.register(spec).await.unwrap();
    let second = registry.get_client("srv").unwrap();

    assert_eq!(first.state(), mcp_protocol::DriverState::Closed);
    assert_eq!(second.state(), mcp_protocol::DriverState::Ready);
}

#[tokio::test]
async fn unregister_removes_the_spec_so_get_client_reports_not_found() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    );
    registry.register(spec).await.unwrap();
    registry.unregister("srv").await.unwrap();

    let err = registry.get_client("srv").unwrap_err();
    assert!(matches!(err, mcp_protocol::McpError::ServerNotFound(_)));
}

#[tokio::test]
async fn get_client_for_an_unknown_id_is_not_found() {
    let registry = registry().await;
    let err = registry.get_client("ghost").unwrap_err();
    assert!(matches!(err, mcp_protocol::McpError::ServerNotFound(_)));
}

#[tokio::test]
async fn registering_a_disabled_spec_builds_no_driver() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    )
    .with_disabled(true);
    registry.register(spec).await.unwrap();

    let err = registry.get_client("srv").unwrap_err();
    assert!(matches!(err, mcp_protocol::McpError::ServerUnavailable { .. }));
    assert!(registry.get_spec("srv").unwrap().disabled);
}

#[tokio::test]
async fn disable_tears_down_the_live_driver_and_persists_the_flag() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    );
    registry.register(spec).await.unwrap();
    let driver = registry.get_client("srv").unwrap();

    registry.disable("srv").await.unwrap();

    assert_eq!(driver.state(), mcp_protocol::DriverState::Closed);
    assert!(registry.get_spec("srv").unwrap().disabled);
}

#[tokio::test]
async fn shutdown_closes_every_live_driver_and_blocks_new_registrations() {
    let (_dir, script) = write_fake_server();
    let registry = registry().await;
    let spec = ServerSpec::new(
        "srv",
        Transport::Stdio {
            command: script.to_str().unwrap().to_string(),
            args: vec![],
            env: vec![],
        },
    );
    registry.register(spec.clone()).await.unwrap();
    registry.shutdown().await.unwrap();

    let err = registry.register(spec).await.unwrap_err();
    assert!(matches!(err, mcp_protocol::McpError::ShuttingDown));
}
