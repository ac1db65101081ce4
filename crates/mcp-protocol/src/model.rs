//! Wire-adjacent data model shared across drivers, registry, and facade.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of one driver's state machine:
/// `Connecting -> Initializing -> Ready -> Disconnected -> (Connecting|Closed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Connecting,
    Initializing,
    Ready,
    Disconnected,
    Closed,
}

impl DriverState {
    /// Whether a `Call`/`Notify` may be issued in this state.
    pub fn accepts_calls(self) -> bool {
        matches!(self, DriverState::Ready)
    }
}

/// A tool advertised by `tools/list`, flattened from the server's raw JSON
/// schema into the fields callers actually need. `server_name` is not part
/// of the wire payload; the facade stamps it in so a caller aggregating
/// across servers can tell tools with the same name apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(default)]
    pub server_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub server_name: String,
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// A prompt advertised by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default)]
    pub server_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The outcome of `tools/call`: either the tool's own result payload, or a
/// tool-level failure (`isError: true` in the MCP result, not a
/// transport/protocol failure — those surface as `McpError::Tool`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Value,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// Diagnostic counts of classified stderr lines from a stdio child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StderrCounters {
    pub info: u64,
    pub warn: u64,
    pub error: u64,
    pub debug: u64,
}

/// A point-in-time view of one server's health, as returned by `GetHealth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub state: DriverState,
    pub last_check_at: SystemTime,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub next_allowed_at: Option<SystemTime>,
    #[serde(default)]
    pub stderr_counters: StderrCounters,
}

/// Retry-supervisor bookkeeping for one server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub next_allowed_at: SystemTime,
}

impl RetryState {
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;
    const BASE_DELAY: Duration = Duration::from_secs(1);
    const MAX_DELAY: Duration = Duration::from_secs(60);

    pub fn fresh() -> Self {
        Self {
            consecutive_failures: 0,
            next_allowed_at: SystemTime::now(),
        }
    }

    /// `backoff(n) = min(60s, 1s * 2^(n-1))`
    pub fn backoff_for(attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(6);
        let scaled = Self::BASE_DELAY * (1u32 << shift);
        scaled.min(Self::MAX_DELAY)
    }

    /// Record one more failure, returning `Err` if the retry budget is now
    /// exhausted (10 consecutive failures requires explicit re-register).
    pub fn record_failure(&mut self, now: SystemTime) -> Result<(), ()> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= Self::MAX_CONSECUTIVE_FAILURES {
            return Err(());
        }
        let delay = Self::backoff_for(self.consecutive_failures);
        self.next_allowed_at = now + delay;
        Ok(())
    }

    pub fn record_success(&mut self, now: SystemTime) {
        self.consecutive_failures = 0;
        self.next_allowed_at = now;
    }

    pub fn may_attempt(&self, now: SystemTime) -> bool {
        now >= self.next_allowed_at
    }
}

/// One outstanding JSON-RPC call a driver is waiting on a response for.
#[derive(Debug)]
pub struct PendingCall {
    pub method: String,
    pub issued_at: SystemTime,
}

impl PendingCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            issued_at: SystemTime::now(),
        }
    }
}
