//! Runtime configuration loaded from the environment with typed defaults,
//! rather than a dedicated config crate.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub grpc_host: String,
    pub grpc_port: u16,
    pub grpc_timeout: Duration,
    pub sse_handshake_timeout: Duration,
    pub stdio_startup_timeout: Duration,
    pub database_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            grpc_host: "127.0.0.1".to_string(),
            grpc_port: 9090,
            grpc_timeout: Duration::from_secs(120),
            sse_handshake_timeout: Duration::from_secs(15),
            stdio_startup_timeout: Duration::from_secs(30),
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from the environment, falling back to [`RuntimeConfig::default`]
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            grpc_host: env_or("MCP_GRPC_HOST", defaults.grpc_host),
            grpc_port: env_parsed("MCP_GRPC_PORT", defaults.grpc_port),
            grpc_timeout: env_secs("MCP_GRPC_TIMEOUT_SECONDS", defaults.grpc_timeout),
            sse_handshake_timeout: env_secs(
                "MCP_SSE_HANDSHAKE_TIMEOUT_SECONDS",
                defaults.sse_handshake_timeout,
            ),
            stdio_startup_timeout: env_secs(
                "MCP_STDIO_STARTUP_TIMEOUT_SECONDS",
                defaults.stdio_startup_timeout,
            ),
            database_url: env_or("MCP_DATABASE_URL", defaults.database_url),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
