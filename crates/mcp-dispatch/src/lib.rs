#![forbid(unsafe_code)]
//! Streaming tool-call dispatch loop: the bridge between an LLM
//! conversation and the MCP client engine's RPC facade.

pub mod directive;
pub mod llm;
pub mod turn;

pub use directive::{Channel, DirectiveScanner, ScanOutput, ToolCallDirective};
pub use llm::{LlmClient, Message, Role, StreamChunk};
pub use turn::{CancelSignal, DispatchLoop, TurnEvent};
