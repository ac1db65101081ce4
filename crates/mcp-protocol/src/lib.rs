#![forbid(unsafe_code)]
//! Wire types, JSON-RPC framing, and the error taxonomy shared by every
//! crate in the MCP client engine. This crate has no I/O of its own — it
//! is the vocabulary `mcp-engine` and `mcp-dispatch` build on.

pub mod error;
pub mod jsonrpc;
pub mod model;
pub mod spec;

pub use error::McpError;
pub use jsonrpc::{Framer, Incoming, RequestId, Response as RpcResponse, RpcError, PROTOCOL_VERSION};
pub use model::{
    CallToolResult, DriverState, HealthSnapshot, PendingCall, Prompt, Resource, RetryState,
    StderrCounters, Tool,
};
pub use spec::{ServerSpec, ToolFilter, Transport};
