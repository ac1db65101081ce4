//! StreamableHTTP transport: a single endpoint accepts POSTed
//! JSON-RPC requests and replies either with a direct JSON body or an
//! `Mcp-Session-Id`-tagged response to be correlated with a later GET. We
//! implement the direct-JSON-response path plus session id propagation;
//! the optional companion SSE stream for server-initiated messages is
//! not implemented.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol::{DriverState, McpError, Response as RpcResponse};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ConnectionCore, Driver};

pub struct StreamableHttpDriver {
    core: Arc<ConnectionCore>,
    http: reqwest::Client,
    url: String,
    bearer: Option<String>,
    session_id: Mutex<Option<String>>,
    handshake_timeout: Duration,
}

impl StreamableHttpDriver {
    pub async fn spawn(
        server_id: impl Into<String>,
        url: &str,
        bearer_env_var: Option<&str>,
        handshake_timeout: Duration,
    ) -> Result<Self, McpError> {
        let server_id = server_id.into();
        let bearer = bearer_env_var.and_then(|name| std::env::var(name).ok());
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| McpError::Transport {
                id: server_id.clone(),
                message: format!("failed to build HTTP client: {err}"),
            })?;

        let driver = Self {
            core: Arc::new(ConnectionCore::new(server_id)),
            http,
            url: url.to_string(),
            bearer,
            session_id: Mutex::new(None),
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
        info!(server = %self.core.server_id, "streamable_http driver ready");
        Ok(())
    }

    async fn send(&self, body: Value, expects_reply: bool) -> Result<Option<Value>, McpError> {
        let mut request = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .json(&body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(session) = self.session_id.lock().await.clone() {
            request = request.header("Mcp-Session-Id", session);
        }

        let response = request.send().await.map_err(|err| McpError::Transport {
            id: self.core.server_id.clone(),
            message: format!("POST failed: {err}"),
        })?;

        if let Some(session_header) = response.headers().get("Mcp-Session-Id") {
            if let Ok(value) = session_header.to_str() {
                *self.session_id.lock().await = Some(value.to_string());
                debug!(server = %self.core.server_id, "captured Mcp-Session-Id");
            }
        }

        if !response.status().is_success() {
            return Err(McpError::Transport {
                id: self.core.server_id.clone(),
                message: format!("endpoint returned status {}", response.status()),
            });
        }

        if !expects_reply {
            return Ok(None);
        }

        let value: Value = response.json().await.map_err(|err| McpError::Protocol {
            id: self.core.server_id.clone(),
            message: format!("malformed JSON response body: {err}"),
        })?;
        Ok(Some(value))
    }
}

#[async_trait]
impl Driver for StreamableHttpDriver {
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
        let (id, _rx) = self.core.register_pending(method)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let reply = self
            .send(body, true)
            .await?
            .ok_or_else(|| McpError::Protocol {
                id: self.core.server_id.clone(),
                message: "expected a JSON-RPC reply body".to_string(),
            })?;
        match mcp_protocol::Framer::decode_value(reply)? {
            mcp_protocol::Incoming::Response { response, .. } => {
                self.core.complete(id, response.clone());
                match response {
                    RpcResponse::Result(value) => Ok(value),
                    RpcResponse::Error(err) => Err(McpError::Tool {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                }
            }
            _ => Err(McpError::Protocol {
                id: self.core.server_id.clone(),
                message: "expected a response envelope".to_string(),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send(body, false).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        self.core.state.set(DriverState::Closed);
        self.core.fail_all_pending("shutdown requested");
        *self.session_id.lock().await = None;
        Ok(())
    }
}
