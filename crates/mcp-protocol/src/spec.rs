//! Server specifications: the durable description of one MCP server a
//! caller has registered, independent of whether it is currently running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How to reach one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Spawn a child process and speak newline-delimited JSON-RPC over its
    /// stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
    },
    /// GET an `text/event-stream` endpoint, capture the `endpoint` event,
    /// POST requests to it.
    Sse {
        url: String,
        #[serde(default)]
        bearer_env_var: Option<String>,
    },
    /// POST/GET a single endpoint, tracking `Mcp-Session-Id`.
    StreamableHttp {
        url: String,
        #[serde(default)]
        bearer_env_var: Option<String>,
    },
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Stdio { .. } => "stdio",
            Transport::Sse { .. } => "sse",
            Transport::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Per-server tool allow/deny filtering. A tool is
/// exposed if `enabled_tools` is empty or contains it, and it is not named
/// in `disabled_tools`. `disabled_tools` always wins over `enabled_tools`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub disabled_tools: Vec<String>,
}

impl ToolFilter {
    pub fn allows(&self, tool_name: &str) -> bool {
        if self.disabled_tools.iter().any(|t| t == tool_name) {
            return false;
        }
        self.enabled_tools.is_empty() || self.enabled_tools.iter().any(|t| t == tool_name)
    }
}

/// Default per-call timeout, in seconds, for a server that doesn't set one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// One registered server: its identity, how to reach it, its tool filter,
/// and the bookkeeping (timeout, disabled flag, timestamps) the registry and
/// persistence layer need. This is the row shape persisted by
/// `mcp-engine::store`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub transport: Transport,
    #[serde(default)]
    pub tool_filter: ToolFilter,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// A disabled spec is persisted but has no driver: [`ServerRegistry::register`]
    /// (in `mcp-engine`) skips connecting it, and any live driver is torn down.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ServerSpec {
    pub fn new(id: impl Into<String>, transport: Transport) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: None,
            description: None,
            transport,
            tool_filter: ToolFilter::default(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            disabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = filter;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Bump `updated_at` to now. Called by the registry/store whenever a
    /// spec is persisted after the caller created it.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_allows_everything() {
        let filter = ToolFilter::default();
        assert!(filter.allows("search"));
    }

    #[test]
    fn disabled_wins_over_enabled() {
        let filter = ToolFilter {
            enabled_tools: vec!["search".into()],
            disabled_tools: vec!["search".into()],
        };
        assert!(!filter.allows("search"));
    }

    #[test]
    fn enabled_list_restricts_when_nonempty() {
        let filter = ToolFilter {
            enabled_tools: vec!["search".into()],
            disabled_tools: vec![],
        };
        assert!(filter.allows("search"));
        assert!(!filter.allows("fetch"));
    }

    #[test]
    fn new_spec_is_enabled_with_the_default_timeout() {
        let spec = ServerSpec::new(
            "fs",
            Transport::Stdio {
                command: "mcp-server-filesystem".to_string(),
                args: vec![],
                env: vec![],
            },
        );
        assert!(!spec.disabled);
        assert_eq!(spec.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(spec.created_at, spec.updated_at);
    }

    #[test]
    fn with_disabled_marks_the_spec_disabled() {
        let spec = ServerSpec::new(
            "fs",
            Transport::Stdio {
                command: "mcp-server-filesystem".to_string(),
                args: vec![],
                env: vec![],
            },
        )
        .with_disabled(true);
        assert!(spec.disabled);
    }
}
