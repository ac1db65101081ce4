//! The tool-call dispatch loop itself: stream the LLM's
//! response, scan the `content` channel for `mcp_tool_call` directives,
//! pause the stream to execute one, splice the result back into the
//! conversation as a tool message, and re-query. Stops when a turn
//! produces no further directive, when `max_turns` is hit, when the
//! caller cancels, or when the turn's wall-clock deadline expires.
//! Progress is reported as it happens via a [`TurnEvent`] channel rather
//! than only at the end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mcp_engine::McpFacade;
use mcp_protocol::{McpError, Tool};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::directive::{Channel, DirectiveScanner, ToolCallDirective};
use crate::llm::{LlmClient, Message, Role};

/// Caps how many tool-call round trips one conversation turn may take
/// before we give up and return control to the caller, so a misbehaving
/// server (or LLM) can't loop forever.
const DEFAULT_MAX_TURNS: usize = 8;

/// Wall-clock budget for one whole turn (every hop combined), independent
/// of `max_turns`. A turn that blows through this is stopped the same way
/// a cancellation stops it.
const DEFAULT_TURN_DEADLINE: Duration = Duration::from_secs(120);

/// One update out of a running turn. Sent as soon as it happens rather
/// than buffered until the turn ends.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A reasoning-channel delta. Never part of the visible message.
    Thinking { delta: String },
    /// A content-channel delta the caller should show immediately.
    Message { delta: String },
    /// The turn ended normally (no further directive).
    Complete { full_content: String, extra_content: Value },
    /// The turn ended because something failed outright.
    Error { message: String },
    /// The turn ended early from cancellation or the wall-clock deadline.
    Stopped { partial_content: String },
}

/// A cooperative cancellation flag shared between the caller and a
/// running turn. Setting it aborts the in-flight LLM stream and any
/// in-flight tool call at their next await point.
#[derive(Clone)]
pub struct CancelSignal(Arc<CancelInner>);

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(CancelInner {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next [`CancelSignal::cancel`] call.
    async fn notified(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DispatchLoop {
    llm: Arc<dyn LlmClient>,
    facade: Arc<McpFacade>,
    max_turns: usize,
    turn_deadline: Duration,
}

impl DispatchLoop {
    pub fn new(llm: Arc<dyn LlmClient>, facade: Arc<McpFacade>) -> Self {
        Self {
            llm,
            facade,
            max_turns: DEFAULT_MAX_TURNS,
            turn_deadline: DEFAULT_TURN_DEADLINE,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_turn_deadline(mut self, turn_deadline: Duration) -> Self {
        self.turn_deadline = turn_deadline;
        self
    }

    /// Build the system-prompt preamble describing every enabled tool
    /// across every ready server, and the directive format the LLM
    /// should use to invoke one.
    pub async fn build_system_preamble(&self) -> Result<String, McpError> {
        let mut sections = vec![DIRECTIVE_FORMAT_DOC.to_string()];
        let tools = self.facade.list_tools(None, self.turn_deadline).await?;
        let mut by_server: BTreeMap<String, Vec<Tool>> = BTreeMap::new();
        for tool in tools {
            by_server.entry(tool.server_name.clone()).or_default().push(tool);
        }
        for (server_name, tools) in by_server {
            let mut lines = vec![format!("Server `{server_name}`:")];
            for tool in tools {
                lines.push(format!(
                    "  - {} — {}",
                    tool.name,
                    tool.description.unwrap_or_default()
                ));
            }
            sections.push(lines.join("\n"));
        }
        Ok(sections.join("\n\n"))
    }

    /// Run the loop to completion for one user turn, returning the full
    /// transcript of messages appended (assistant prose and tool results).
    /// Progress streams out through `events`; `cancel` aborts the turn at
    /// its next await point.
    pub async fn run(
        &self,
        mut messages: Vec<Message>,
        cancel: CancelSignal,
        events: mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<Vec<Message>, McpError> {
        let mut produced = Vec::new();
        let mut full_content = String::new();
        let mut extra_content = Vec::new();
        let deadline_at = Instant::now() + self.turn_deadline;

        for hop in 0..self.max_turns {
            if cancel.is_cancelled() || Instant::now() >= deadline_at {
                let _ = events.send(TurnEvent::Stopped {
                    partial_content: full_content.clone(),
                });
                return Ok(produced);
            }

            let mut stream = match self.llm.stream_completion(&messages).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events.send(TurnEvent::Error {
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            };
            let mut scanner = DirectiveScanner::new();
            let mut assistant_text = String::new();
            let mut directive: Option<ToolCallDirective> = None;
            let mut stopped = false;

            loop {
                tokio::select! {
                    _ = cancel.notified() => {
                        stopped = true;
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline_at) => {
                        stopped = true;
                        break;
                    }
                    next = stream.next() => {
                        let Some(chunk) = next else { break };
                        let chunk = match chunk {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                let _ = events.send(TurnEvent::Error {
                                    message: err.to_string(),
                                });
                                return Err(err);
                            }
                        };
                        match chunk.channel {
                            Channel::Reasoning => {
                                let _ = events.send(TurnEvent::Thinking { delta: chunk.delta });
                            }
                            Channel::Content => {
                                let output = scanner.feed(Channel::Content, &chunk.delta);
                                if !output.prose.is_empty() {
                                    let _ = events.send(TurnEvent::Message { delta: output.prose.clone() });
                                    assistant_text.push_str(&output.prose);
                                }
                                if output.directive.is_some() {
                                    directive = output.directive;
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            assistant_text.push_str(&scanner.finish());
            full_content.push_str(&assistant_text);

            if stopped {
                let _ = events.send(TurnEvent::Stopped {
                    partial_content: full_content.clone(),
                });
                return Ok(produced);
            }

            let assistant_message = Message {
                role: Role::Assistant,
                content: assistant_text,
            };
            messages.push(assistant_message.clone());
            produced.push(assistant_message);

            let Some(directive) = directive else {
                debug!(hop, "turn produced no directive, dispatch loop complete");
                let _ = events.send(TurnEvent::Complete {
                    full_content: full_content.clone(),
                    extra_content: Value::Array(extra_content),
                });
                return Ok(produced);
            };

            let remaining = deadline_at.saturating_duration_since(Instant::now());
            let tool_message = self.execute_directive(&directive, remaining, &cancel).await;
            if let Ok(value) = serde_json::from_str::<Value>(&tool_message.content) {
                extra_content.push(value);
            }
            messages.push(tool_message.clone());
            produced.push(tool_message);
        }

        warn!(max_turns = self.max_turns, "dispatch loop hit its turn cap");
        let _ = events.send(TurnEvent::Complete {
            full_content: full_content.clone(),
            extra_content: Value::Array(extra_content),
        });
        Ok(produced)
    }

    async fn execute_directive(
        &self,
        directive: &ToolCallDirective,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Message {
        let outcome = tokio::select! {
            _ = cancel.notified() => None,
            outcome = self.facade.call_tool(
                &directive.server_name,
                &directive.tool_name,
                directive.arguments.clone(),
                deadline,
            ) => Some(outcome),
        };

        let payload = match outcome {
            None => json!({
                "server_name": directive.server_name,
                "tool_name": directive.tool_name,
                "cancelled": true,
            }),
            Some(Ok(result)) => json!({
                "server_name": directive.server_name,
                "tool_name": directive.tool_name,
                "result": result.content,
                "isError": result.is_error,
            }),
            Some(Err(err)) => json!({
                "server_name": directive.server_name,
                "tool_name": directive.tool_name,
                "error": err.to_string(),
            }),
        };

        Message {
            role: Role::Tool,
            content: payload.to_string(),
        }
    }
}

const DIRECTIVE_FORMAT_DOC: &str = r#"To call a tool, emit a single fenced block (``` or ```json) in your main response:
```json
{"type": "mcp_tool_call", "server_name": "<server id>", "tool_name": "<tool name>", "arguments": {...}}
```
Emit at most one such block per response. Wait for the tool result before continuing."#;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use mcp_engine::{HandshakeTimeouts, ServerRegistry, SqlSpecStore};
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<Vec<&'static str>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn stream_completion(
            &self,
            _messages: &[Message],
        ) -> Result<BoxStream<'static, Result<crate::llm::StreamChunk, McpError>>, McpError> {
            let next = self.responses.lock().unwrap().remove(0);
            let chunks: Vec<Result<crate::llm::StreamChunk, McpError>> = next
                .into_iter()
                .map(|delta| {
                    Ok(crate::llm::StreamChunk {
                        channel: Channel::Content,
                        delta: delta.to_string(),
                    })
                })
                .collect();
            Ok(stream::iter(chunks).boxed())
        }
    }

    async fn empty_facade() -> Arc<McpFacade> {
        let store = Arc::new(SqlSpecStore::connect("sqlite::memory:").await.unwrap());
        let registry = Arc::new(ServerRegistry::new(store, HandshakeTimeouts::default()));
        Arc::new(McpFacade::new(registry))
    }

    #[tokio::test]
    async fn loop_stops_after_a_response_with_no_directive() {
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![vec!["just a plain answer, no tools needed"]]),
        });
        let facade = empty_facade().await;
        let dispatch = DispatchLoop::new(llm, facade);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = dispatch
            .run(
                vec![Message {
                    role: Role::User,
                    content: "hello".to_string(),
                }],
                CancelSignal::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].role, Role::Assistant);
        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::Complete { .. } = event {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn loop_surfaces_a_tool_error_as_a_tool_message_and_stops() {
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![
                vec![
                    "checking... ```json\n",
                    "{\"type\": \"mcp_tool_call\", \"server_name\": \"missing\", \"tool_name\": \"noop\", \"arguments\": {}}\n```",
                ],
                vec!["the tool call failed, so I'll stop here"],
            ]),
        });
        let facade = empty_facade().await;
        let dispatch = DispatchLoop::new(llm, facade);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = dispatch
            .run(
                vec![Message {
                    role: Role::User,
                    content: "use a tool".to_string(),
                }],
                CancelSignal::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result[1].role, Role::Tool);
        assert!(result[1].content.contains("error"));
        assert_eq!(result[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn a_pre_cancelled_signal_stops_the_loop_before_any_hop() {
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![vec!["should never be read"]]),
        });
        let facade = empty_facade().await;
        let dispatch = DispatchLoop::new(llm, facade);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let result = dispatch
            .run(
                vec![Message {
                    role: Role::User,
                    content: "hello".to_string(),
                }],
                cancel,
                tx,
            )
            .await
            .unwrap();

        assert!(result.is_empty());
        let event = rx.try_recv().expect("a stopped event");
        assert!(matches!(event, TurnEvent::Stopped { .. }));
    }
}
