//! The LLM side of the dispatch loop: a minimal trait the loop drives, kept
//! deliberately thin since the actual model backend is out of scope for
//! this system.

use async_trait::async_trait;
use futures::stream::BoxStream;
use mcp_protocol::McpError;
use serde::{Deserialize, Serialize};

use crate::directive::Channel;

/// One message in the running conversation, in the shape a chat-completions
/// style API expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of a streaming completion: which channel it belongs to and
/// the text delta.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub channel: Channel,
    pub delta: String,
}

/// What drives a turn forward. Implementations wrap whatever chat-completions
/// API is actually in use; the dispatch loop only needs a token stream.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<StreamChunk, McpError>>, McpError>;
}
