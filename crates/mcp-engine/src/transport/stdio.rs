//! Child-process stdio transport: a writer task owns stdin, a reader task
//! owns stdout, a stderr task classifies diagnostic output into tracing
//! levels.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol::{DriverState, Incoming, McpError, Response as RpcResponse};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{ConnectionCore, Driver};

pub struct StdioDriver {
    core: Arc<ConnectionCore>,
    outbound: mpsc::UnboundedSender<String>,
    child: Arc<Mutex<Option<Child>>>,
    handshake_timeout: Duration,
}

impl StdioDriver {
    pub async fn spawn(
        server_id: impl Into<String>,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        handshake_timeout: Duration,
    ) -> Result<Self, McpError> {
        let server_id = server_id.into();
        let core = Arc::new(ConnectionCore::new(server_id.clone()));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| McpError::Transport {
            id: server_id.clone(),
            message: format!("failed to spawn `{command}`: {err}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            id: server_id.clone(),
            message: "child process had no stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            id: server_id.clone(),
            message: "child process had no stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| McpError::Transport {
            id: server_id.clone(),
            message: "child process had no stderr".to_string(),
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = rx.recv().await {
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    warn!("stdio writer task exiting: {err}");
                    break;
                }
                if let Err(err) = stdin.write_all(b"\n").await {
                    warn!("stdio writer task exiting: {err}");
                    break;
                }
            }
        });

        let reader_core = core.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match mcp_protocol::Framer::decode(&line) {
                            Ok(Incoming::Response { id, response }) => {
                                reader_core.complete(id, response);
                            }
                            Ok(Incoming::Notification { method, .. }) => {
                                debug!(server = %reader_core.server_id, %method, "server notification");
                            }
                            Ok(Incoming::ServerRequest { id, method }) => {
                                warn!(server = %reader_core.server_id, %method, "unsupported server-initiated request");
                                let _ = id;
                            }
                            Err(err) => {
                                warn!(server = %reader_core.server_id, %err, "dropping malformed line");
                            }
                        }
                    }
                    Ok(None) => {
                        reader_core.state.set(DriverState::Disconnected);
                        reader_core.fail_all_pending("stdout closed");
                        break;
                    }
                    Err(err) => {
                        warn!(server = %reader_core.server_id, %err, "stdout read error");
                        reader_core.state.set(DriverState::Disconnected);
                        reader_core.fail_all_pending("stdout read error");
                        break;
                    }
                }
            }
        });

        let stderr_core = core.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                classify_and_log(&stderr_core, &line);
            }
        });

        let driver = Self {
            core,
            outbound: tx,
            child: Arc::new(Mutex::new(Some(child))),
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
        info!(server = %self.core.server_id, "stdio driver ready");
        Ok(())
    }
}

const ERROR_KEYWORDS: &[&str] = &["error", "exception", "failed", "failure", "fatal", "critical"];
const WARN_KEYWORDS: &[&str] = &["warn", "warning", "deprecated", "警告"];
const INFO_KEYWORDS: &[&str] = &[
    "started",
    "running",
    "server",
    "installed",
    "packages",
    "成功",
    "完成",
    "已启动",
    "✅",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classify one stderr line into a tracing level and bump the matching
/// counter. Classification never influences protocol handling — it only
/// decides how loudly we log.
fn classify_and_log(core: &ConnectionCore, line: &str) {
    let lower = line.to_ascii_lowercase();
    if contains_any(&lower, ERROR_KEYWORDS) {
        core.bump_stderr("error");
        error!(server = %core.server_id, "{line}");
    } else if contains_any(&lower, WARN_KEYWORDS) {
        core.bump_stderr("warn");
        warn!(server = %core.server_id, "{line}");
    } else if contains_any(&lower, INFO_KEYWORDS) || is_package_install_noise(&lower) {
        core.bump_stderr("info");
        info!(server = %core.server_id, "{line}");
    } else {
        core.bump_stderr("debug");
        debug!(server = %core.server_id, "{line}");
    }
}

/// Recognizes npm/pip-style install chatter like "added 42 packages in
/// 318ms" as ordinary startup noise.
fn is_package_install_noise(lower: &str) -> bool {
    let Some(packages_idx) = lower.find("package") else {
        return false;
    };
    let before = &lower[..packages_idx];
    let after = &lower[packages_idx..];
    before.split_whitespace().next_back().is_some_and(|tok| tok.chars().all(|c| c.is_ascii_digit()))
        && after.contains(" in ")
        && after.trim_end_matches('.').ends_with("ms")
}

#[async_trait]
impl Driver for StdioDriver {
    fn id(&self) -> &str {
        &self.core.server_id
    }

    fn state(&self) -> DriverState {
        self.core.state.get()
    }

    fn stderr_counters(&self) -> mcp_protocol::StderrCounters {
        self.core.counters_snapshot()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let state = self.core.state.get();
        if method != "initialize" && !state.accepts_calls() {
            return Err(McpError::Protocol {
                id: self.core.server_id.clone(),
                message: format!("call issued while driver is in state {state:?}"),
            });
        }
        let (id, rx) = self.core.register_pending(method)?;
        let (_, bytes) = self.core.framer_build(id, method, params);
        self.outbound.send(bytes).map_err(|_| McpError::Transport {
            id: self.core.server_id.clone(),
            message: "stdio writer task has exited".to_string(),
        })?;
        let response = rx.await.map_err(|_| McpError::Transport {
            id: self.core.server_id.clone(),
            message: "driver shut down while call was pending".to_string(),
        })?;
        match response {
            RpcResponse::Result(value) => Ok(value),
            RpcResponse::Error(err) => Err(McpError::Tool {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let bytes = self.core.framer.build_notification(method, params);
        self.outbound.send(bytes).map_err(|_| McpError::Transport {
            id: self.core.server_id.clone(),
            message: "stdio writer task has exited".to_string(),
        })
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        self.core.state.set(DriverState::Closed);
        self.core.fail_all_pending("shutdown requested");
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
        Ok(())
    }
}

impl ConnectionCore {
    /// Build the wire bytes for an already-allocated request id. Kept on
    /// `ConnectionCore` so `register_pending` and serialization share one
    /// lock-free path through the framer.
    fn framer_build(&self, id: mcp_protocol::RequestId, method: &str, params: Value) -> (mcp_protocol::RequestId, String) {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, message.to_string())
    }
}

impl Drop for StdioDriver {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_keyword() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "ERROR: connection refused");
        assert_eq!(core.counters_snapshot().error, 1);
    }

    #[test]
    fn classifies_an_exception_keyword_as_error() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "uncaught exception in handler");
        assert_eq!(core.counters_snapshot().error, 1);
    }

    #[test]
    fn classifies_a_deprecation_notice_as_warn() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "this flag is deprecated, use --new-flag instead");
        assert_eq!(core.counters_snapshot().warn, 1);
    }

    #[test]
    fn classifies_package_install_noise_as_info() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "added 42 packages in 318ms");
        assert_eq!(core.counters_snapshot().info, 1);
    }

    #[test]
    fn classifies_plain_line_as_info() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "server listening on stdio");
        assert_eq!(core.counters_snapshot().info, 1);
    }

    #[test]
    fn classifies_an_unmatched_line_as_debug_by_default() {
        let core = ConnectionCore::new("srv");
        classify_and_log(&core, "tick 42");
        assert_eq!(core.counters_snapshot().debug, 1);
    }
}
