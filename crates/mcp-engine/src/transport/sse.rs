//! SSE transport: GET a `text/event-stream`, capture the
//! `endpoint` event as the POST target, then exchange JSON-RPC envelopes
//! as `message` events / POST bodies.
//!
//! The `should_reconnect` flag avoids a reconnect race on teardown: once
//! `shutdown()` is called we must not race a fresh GET against the socket
//! we're tearing down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcp_protocol::{DriverState, Incoming, McpError, Response as RpcResponse};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use super::{ConnectionCore, Driver};

pub struct SseDriver {
    core: Arc<ConnectionCore>,
    http: reqwest::Client,
    base_url: Url,
    post_uri: Arc<Mutex<Option<Url>>>,
    should_reconnect: Arc<AtomicBool>,
    bearer: Option<String>,
    handshake_timeout: Duration,
}

impl SseDriver {
    pub async fn spawn(
        server_id: impl Into<String>,
        url: &str,
        bearer_env_var: Option<&str>,
        handshake_timeout: Duration,
    ) -> Result<Self, McpError> {
        let server_id = server_id.into();
        let base_url = Url::parse(url).map_err(|err| McpError::Transport {
            id: server_id.clone(),
            message: format!("invalid SSE url `{url}`: {err}"),
        })?;
        let bearer = resolve_bearer(bearer_env_var);
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| McpError::Transport {
                id: server_id.clone(),
                message: format!("failed to build HTTP client: {err}"),
            })?;

        let core = Arc::new(ConnectionCore::new(server_id));
        let post_uri = Arc::new(Mutex::new(None));
        let should_reconnect = Arc::new(AtomicBool::new(true));

        spawn_event_stream(
            core.clone(),
            http.clone(),
            base_url.clone(),
            bearer.clone(),
            post_uri.clone(),
            should_reconnect.clone(),
        )
        .await?;

        let driver = Self {
            core,
            http,
            base_url,
            post_uri,
            should_reconnect,
            bearer,
            handshake_timeout,
        };

        driver.handshake().await?;
        Ok(driver)
    }

    async fn handshake(&self) -> Result<(), McpError> {
        self.core.state.set(DriverState::Initializing);
        let params = ConnectionCore::initialize_request_params();
        tokio::time::timeout(self.handshake_timeout, self.call("initialize", params))
            .await
            .map_err(|_| McpError::CallTimeout(self.handshake_timeout))??;
        self.notify("notifications/initialized", json!({})).await?;
        self.core.state.set(DriverState::Ready);
        info!(server = %self.core.server_id, "sse driver ready");
        Ok(())
    }

    async fn post(&self, body: String) -> Result<(), McpError> {
        let uri = self
            .post_uri
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::Protocol {
                id: self.core.server_id.clone(),
                message: "no endpoint event received yet".to_string(),
            })?;
        let mut request = self
            .http
            .post(uri)
            .header("content-type", "application/json")
            .body(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|err| McpError::Transport {
            id: self.core.server_id.clone(),
            message: format!("POST to SSE endpoint failed: {err}"),
        })?;
        if !response.status().is_success() {
            return Err(McpError::Transport {
                id: self.core.server_id.clone(),
                message: format!("SSE endpoint returned status {}", response.status()),
            });
        }
        Ok(())
    }
}

fn resolve_bearer(var: Option<&str>) -> Option<String> {
    var.and_then(|name| std::env::var(name).ok())
}

async fn spawn_event_stream(
    core: Arc<ConnectionCore>,
    http: reqwest::Client,
    base_url: Url,
    bearer: Option<String>,
    post_uri: Arc<Mutex<Option<Url>>>,
    should_reconnect: Arc<AtomicBool>,
) -> Result<(), McpError> {
    let mut request = http.get(base_url.clone()).header("accept", "text/event-stream");
    if let Some(token) = &bearer {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|err| McpError::Transport {
        id: core.server_id.clone(),
        message: format!("GET to SSE endpoint failed: {err}"),
    })?;
    if !response.status().is_success() {
        return Err(McpError::Transport {
            id: core.server_id.clone(),
            message: format!("SSE endpoint returned status {}", response.status()),
        });
    }

    let byte_stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)));
    let reader = StreamReader::new(byte_stream);
    let mut lines = BufReader::new(reader).lines();

    tokio::spawn(async move {
        let mut event_name = String::new();
        let mut data_buf = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        dispatch_event(&core, &base_url, &post_uri, &event_name, &data_buf).await;
                        event_name.clear();
                        data_buf.clear();
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("event:") {
                        event_name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        if !data_buf.is_empty() {
                            data_buf.push('\n');
                        }
                        data_buf.push_str(rest.trim_start());
                    }
                }
                Ok(None) => {
                    core.state.set(DriverState::Disconnected);
                    core.fail_all_pending("sse stream closed");
                    if !should_reconnect.load(Ordering::SeqCst) {
                        debug!(server = %core.server_id, "sse stream closed during teardown, not reconnecting");
                    } else {
                        warn!(server = %core.server_id, "sse stream closed unexpectedly");
                    }
                    break;
                }
                Err(err) => {
                    warn!(server = %core.server_id, %err, "sse stream read error");
                    core.state.set(DriverState::Disconnected);
                    core.fail_all_pending("sse stream error");
                    break;
                }
            }
        }
    });

    Ok(())
}

async fn dispatch_event(
    core: &Arc<ConnectionCore>,
    base_url: &Url,
    post_uri: &Arc<Mutex<Option<Url>>>,
    event_name: &str,
    data: &str,
) {
    if data.is_empty() {
        return;
    }
    match event_name {
        "endpoint" => match base_url.join(data) {
            Ok(resolved) => {
                *post_uri.lock().await = Some(resolved);
                debug!(server = %core.server_id, "resolved sse post endpoint");
            }
            Err(err) => warn!(server = %core.server_id, %err, "malformed endpoint event"),
        },
        _ => match mcp_protocol::Framer::decode(data) {
            Ok(Incoming::Response { id, response }) => core.complete(id, response),
            Ok(Incoming::Notification { method, .. }) => {
                debug!(server = %core.server_id, %method, "server notification")
            }
            Ok(Incoming::ServerRequest { method, .. }) => {
                warn!(server = %core.server_id, %method, "unsupported server-initiated request")
            }
            Err(err) => warn!(server = %core.server_id, %err, "dropping malformed sse event"),
        },
    }
}

#[async_trait]
impl Driver for SseDriver {
    fn id(&self) -> &str {
        &self.core.server_id
    }

    fn state(&self) -> DriverState {
        self.core.state.get()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let state = self.core.state.get();
        if method != "initialize" && !state.accepts_calls() {
            return Err(McpError::Protocol {
                id: self.core.server_id.clone(),
                message: format!("call issued while driver is in state {state:?}"),
            });
        }
        let (id, rx) = self.core.register_pending(method)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        self.post(body).await?;
        let response = tokio::time::timeout(self.handshake_timeout.max(Duration::from_secs(30)), rx)
            .await
            .map_err(|_| McpError::CallTimeout(Duration::from_secs(30)))?
            .map_err(|_| McpError::Transport {
                id: self.core.server_id.clone(),
                message: "driver shut down while call was pending".to_string(),
            })?;
        match response {
            RpcResponse::Result(value) => Ok(value),
            RpcResponse::Error(err) => Err(McpError::Tool {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params }).to_string();
        self.post(body).await
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.core.state.set(DriverState::Closed);
        self.core.fail_all_pending("shutdown requested");
        Ok(())
    }
}
