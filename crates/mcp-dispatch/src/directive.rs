//! Tool-call directive scanning: the LLM emits its normal
//! prose, and somewhere in the `content` channel a fenced code block
//! (```` ``` ```` or ```` ```json ````) carrying a flat `mcp_tool_call`
//! envelope asks us to run a tool. [`DirectiveScanner`] buffers streamed
//! text and yields complete directives as soon as their closing fence
//! arrives, without needing the whole response up front.
//!
//! Directives are only recognized in the `content` channel. A `reasoning`
//! channel never triggers a tool call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const FENCE_MARK: &str = "```";
const FENCE_LANG: &str = "json";

/// Which stream the LLM is writing to. Only `Content` is scanned for tool
/// calls; `Reasoning` passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Content,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDirective {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DirectiveEnvelope {
    McpToolCall {
        server_name: String,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// What came out of feeding the scanner one chunk of text.
#[derive(Debug, Default)]
pub struct ScanOutput {
    /// Plain prose to show the caller immediately (text outside any fence,
    /// or inside a fence that turned out not to be a directive).
    pub prose: String,
    /// A directive, if a complete fenced block closed during this feed.
    pub directive: Option<ToolCallDirective>,
}

/// Whether the characters right after an opening ``` are enough to decide
/// if a `json` language tag follows.
enum FenceLang {
    /// Not enough buffered yet to tell; wait for the next chunk.
    NeedMore,
    /// Decided: `json` was/wasn't present, consuming this many extra bytes.
    Definite(usize),
}

fn classify_fence_lang(rest: &str) -> FenceLang {
    if rest.starts_with(FENCE_LANG) {
        FenceLang::Definite(FENCE_LANG.len())
    } else if rest.len() < FENCE_LANG.len() && FENCE_LANG.starts_with(rest) {
        FenceLang::NeedMore
    } else {
        FenceLang::Definite(0)
    }
}

/// Stateful line-oriented scanner. One instance per LLM turn.
#[derive(Debug, Default)]
pub struct DirectiveScanner {
    buffer: String,
    in_fence: bool,
    fence_has_lang: bool,
    fence_body: String,
}

impl DirectiveScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of `content`-channel text, draining any complete
    /// fenced block(s) it completes.
    pub fn feed(&mut self, channel: Channel, chunk: &str) -> ScanOutput {
        if channel != Channel::Content {
            return ScanOutput {
                prose: chunk.to_string(),
                directive: None,
            };
        }

        self.buffer.push_str(chunk);
        let mut output = ScanOutput::default();

        loop {
            if !self.in_fence {
                match self.buffer.find(FENCE_MARK) {
                    Some(start) => {
                        let rest = &self.buffer[start + FENCE_MARK.len()..];
                        match classify_fence_lang(rest) {
                            FenceLang::NeedMore => {
                                output.prose.push_str(&self.buffer[..start]);
                                self.buffer.drain(..start);
                                break;
                            }
                            FenceLang::Definite(lang_len) => {
                                output.prose.push_str(&self.buffer[..start]);
                                self.buffer.drain(..start + FENCE_MARK.len() + lang_len);
                                self.in_fence = true;
                                self.fence_has_lang = lang_len > 0;
                                self.fence_body.clear();
                            }
                        }
                    }
                    None => {
                        // Keep a tail long enough to still catch a fence
                        // marker split across chunk boundaries.
                        let keep_from = self.buffer.len().saturating_sub(FENCE_MARK.len() - 1);
                        output.prose.push_str(&self.buffer[..keep_from]);
                        self.buffer.drain(..keep_from);
                        break;
                    }
                }
            } else {
                match self.buffer.find(FENCE_MARK) {
                    Some(end) => {
                        self.fence_body.push_str(&self.buffer[..end]);
                        self.buffer.drain(..end + FENCE_MARK.len());
                        self.in_fence = false;

                        match parse_directive(&self.fence_body) {
                            Some(directive) => {
                                output.directive = Some(directive);
                                // A turn only ever acts on its first
                                // directive; remaining buffered text is
                                // surfaced as prose on the next feed once
                                // the tool result has been spliced back.
                                return output;
                            }
                            None => {
                                output.prose.push_str(FENCE_MARK);
                                if self.fence_has_lang {
                                    output.prose.push_str(FENCE_LANG);
                                }
                                output.prose.push_str(&self.fence_body);
                                output.prose.push_str(FENCE_MARK);
                            }
                        }
                    }
                    None => break,
                }
            }
        }

        output
    }

    /// Flush whatever is left once the stream ends. An unterminated fence
    /// is returned verbatim as prose rather than silently dropped.
    pub fn finish(mut self) -> String {
        if self.in_fence {
            let mut tail = String::new();
            tail.push_str(FENCE_MARK);
            if self.fence_has_lang {
                tail.push_str(FENCE_LANG);
            }
            tail.push_str(&self.fence_body);
            tail.push_str(&self.buffer);
            tail
        } else {
            std::mem::take(&mut self.buffer)
        }
    }
}

fn parse_directive(fence_body: &str) -> Option<ToolCallDirective> {
    let envelope: DirectiveEnvelope = serde_json::from_str(fence_body.trim()).ok()?;
    let DirectiveEnvelope::McpToolCall {
        server_name,
        tool_name,
        arguments,
    } = envelope;
    Some(ToolCallDirective {
        server_name,
        tool_name,
        arguments,
    })
}
