//! Transport drivers. Each driver owns exactly one live
//! connection to one MCP server and exposes the same `Driver` trait
//! regardless of whether the wire is a child process, SSE, or
//! StreamableHTTP. The handshake and pending-call bookkeeping are shared
//! via [`ConnectionCore`]; only how bytes move is driver-specific.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use mcp_protocol::{
    CallToolResult, DriverState, Framer, McpError, PendingCall, RequestId, Response as RpcResponse,
    StderrCounters, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use sse::SseDriver;
pub use stdio::StdioDriver;
pub use streamable_http::StreamableHttpDriver;

/// Behavior every driver exposes to the registry/facade, independent of
/// wire format.
#[async_trait]
pub trait Driver: Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> DriverState;
    fn stderr_counters(&self) -> StderrCounters {
        StderrCounters::default()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let result = self
            .call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result).map_err(McpError::from)
    }

    async fn list_tools(&self) -> Result<Value, McpError> {
        self.call("tools/list", json!({})).await
    }

    async fn list_resources(&self) -> Result<Value, McpError> {
        self.call("resources/list", json!({})).await
    }

    async fn list_prompts(&self) -> Result<Value, McpError> {
        self.call("prompts/list", json!({})).await
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError>;
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError>;
    async fn shutdown(&self) -> Result<(), McpError>;
}

/// Atomic, clonable view of a driver's lifecycle state.
#[derive(Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(initial: DriverState) -> Self {
        Self(Arc::new(AtomicU8::new(encode(initial))))
    }

    pub fn get(&self) -> DriverState {
        decode(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: DriverState) {
        self.0.store(encode(state), Ordering::SeqCst);
    }
}

fn encode(state: DriverState) -> u8 {
    match state {
        DriverState::Connecting => 0,
        DriverState::Initializing => 1,
        DriverState::Ready => 2,
        DriverState::Disconnected => 3,
        DriverState::Closed => 4,
    }
}

fn decode(byte: u8) -> DriverState {
    match byte {
        0 => DriverState::Connecting,
        1 => DriverState::Initializing,
        2 => DriverState::Ready,
        3 => DriverState::Disconnected,
        _ => DriverState::Closed,
    }
}

/// Shared bookkeeping every driver embeds: id allocation, the pending-call
/// table, current state, and stderr diagnostics.
pub struct ConnectionCore {
    pub server_id: String,
    pub framer: Framer,
    pending: DashMap<RequestId, (PendingCall, oneshot::Sender<RpcResponse>)>,
    pub state: StateCell,
    pub stderr_counters: DashMap<&'static str, u64>,
}

impl ConnectionCore {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            framer: Framer::new(),
            pending: DashMap::new(),
            state: StateCell::new(DriverState::Connecting),
            stderr_counters: DashMap::new(),
        }
    }

    /// Allocate a request id and register a waiter for it. Returns an error
    /// if the allocator somehow produced an id still pending.
    pub fn register_pending(&self, method: &str) -> Result<(RequestId, oneshot::Receiver<RpcResponse>), McpError> {
        let id = self.framer.next_id();
        if self.pending.contains_key(&id) {
            return Err(McpError::Protocol {
                id: self.server_id.clone(),
                message: format!("request id {id} is already in flight"),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, (PendingCall::new(method), tx));
        Ok((id, rx))
    }

    /// Route a decoded response to its waiter, if any is still registered.
    pub fn complete(&self, id: RequestId, response: RpcResponse) {
        if let Some((_, (_, tx))) = self.pending.remove(&id) {
            let _ = tx.send(response);
        } else {
            debug!(server = %self.server_id, id, "response for unknown or retired id, dropping");
        }
    }

    /// Fail every outstanding waiter, used on disconnect/shutdown so no
    /// caller hangs forever.
    pub fn fail_all_pending(&self, message: &str) {
        for entry in self.pending.iter() {
            warn!(server = %self.server_id, id = *entry.key(), method = %entry.value().0.method, "failing pending call: {message}");
        }
        self.pending.clear();
    }

    pub fn bump_stderr(&self, level: &'static str) {
        *self.stderr_counters.entry(level).or_insert(0) += 1;
    }

    pub fn counters_snapshot(&self) -> StderrCounters {
        let get = |level: &str| self.stderr_counters.get(level).map(|r| *r.value()).unwrap_or(0);
        StderrCounters {
            info: get("info"),
            warn: get("warn"),
            error: get("error"),
            debug: get("debug"),
        }
    }

    pub fn initialize_request_params() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "mcp-client-engine", "version": env!("CARGO_PKG_VERSION") },
        })
    }
}

/// Default handshake timeout used when a per-transport config doesn't
/// override it.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn now() -> SystemTime {
    SystemTime::now()
}
