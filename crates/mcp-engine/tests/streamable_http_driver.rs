//! StreamableHTTP driver against a mocked endpoint: handshake,
//! a successful tool call, a tool-level error, a non-2xx response, and
//! `Mcp-Session-Id` propagation across requests.

use std::time::Duration;

use mcp_engine::{Driver, StreamableHttpDriver};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

async fn mount_ok(server: &MockServer, method_name: &str, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains(format!("\"method\":\"{method_name}\"")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": result,
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn handshake_succeeds_against_a_mocked_endpoint() {
    let server = MockServer::start().await;
    mount_ok(&server, "initialize", json!({})).await;
    mount_ok(&server, "notifications/initialized", json!({})).await;

    let driver = StreamableHttpDriver::spawn("srv", &server.uri(), None, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(driver.state(), mcp_protocol::DriverState::Ready);
}

#[tokio::test]
async fn call_tool_returns_the_mocked_result() {
    let server = MockServer::start().await;
    mount_ok(&server, "initialize", json!({})).await;
    mount_ok(&server, "notifications/initialized", json!({})).await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("\"method\":\"tools/call\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": { "content": [{"type": "text", "text": "ok"}], "isError": false },
        })))
        .mount(&server)
        .await;

    let driver = StreamableHttpDriver::spawn("srv", &server.uri(), None, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();

    let result = driver.call_tool("echo", json!({"text": "hi"})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0]["text"], "ok");
}

#[tokio::test]
async fn a_json_rpc_error_reply_surfaces_as_a_tool_error() {
    let server = MockServer::start().await;
    mount_ok(&server, "initialize", json!({})).await;
    mount_ok(&server, "notifications/initialized", json!({})).await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("\"method\":\"tools/call\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": { "code": -32601, "message": "unknown tool" },
        })))
        .mount(&server)
        .await;

    let driver = StreamableHttpDriver::spawn("srv", &server.uri(), None, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();

    let err = driver.call_tool("missing", json!({})).await.unwrap_err();
    match err {
        mcp_protocol::McpError::Tool { code, message, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "unknown tool");
        }
        other => panic!("expected a Tool error, got {other:?}"),
    }
}

#[tokio::test]
async fn a_non_success_status_during_handshake_fails_spawn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = StreamableHttpDriver::spawn("srv", &server.uri(), None, HANDSHAKE_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, mcp_protocol::McpError::Transport { .. }));
}

#[tokio::test]
async fn an_mcp_session_id_header_is_captured_and_resent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("\"method\":\"initialize\""))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "session-abc")
                .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": {} })),
        )
        .mount(&server)
        .await;
    mount_ok(&server, "notifications/initialized", json!({})).await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("\"method\":\"tools/call\""))
        .and(header("Mcp-Session-Id", "session-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": { "content": [], "isError": false },
        })))
        .mount(&server)
        .await;

    let driver = StreamableHttpDriver::spawn("srv", &server.uri(), None, HANDSHAKE_TIMEOUT)
        .await
        .unwrap();

    // Only succeeds if the session id captured from the handshake reply
    // was attached to this request, since that's the only mock that
    // matches the Mcp-Session-Id header requirement.
    driver.call_tool("noop", json!({})).await.unwrap();
}
