use std::time::SystemTime;

use serde_json::Value;
use thiserror::Error;

/// Error taxonomy shared by every layer of the MCP client engine.
///
/// Variants mirror the status codes the RPC facade maps them to
/// (`NOT_FOUND`, `UNAVAILABLE`, `FAILED_PRECONDITION`, `DEADLINE_EXCEEDED`,
/// `INTERNAL`). `ToolError` and `CallTimeout` never increment a server's
/// retry counter; every other variant does.
#[derive(Debug, Error, Clone)]
pub enum McpError {
    #[error("no server registered with id `{0}`")]
    ServerNotFound(String),

    #[error("server `{id}` is unavailable; next retry allowed at {next_allowed_at:?}")]
    ServerUnavailable {
        id: String,
        next_allowed_at: SystemTime,
    },

    #[error("retry budget exhausted for server `{0}`; re-register to reset")]
    RetryExhausted(String),

    #[error("transport error on server `{id}`: {message}")]
    Transport { id: String, message: String },

    #[error("protocol error on server `{id}`: {message}")]
    Protocol { id: String, message: String },

    #[error("tool call failed with JSON-RPC error {code}: {message}")]
    Tool {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("call timed out after {0:?}")]
    CallTimeout(std::time::Duration),

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization(err.to_string())
    }
}

impl McpError {
    /// Whether observing this error should increment the retry supervisor's
    /// failure counter for the given server.
    pub fn increments_retry_counter(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::Protocol { .. }
        )
    }
}
