//! Server registry: the one-live-driver-per-id authority.
//! Registering a server persists its spec and spins up a driver; a second
//! register for the same id tears down the old driver first so exactly one
//! live connection ever exists per id. A spec with `disabled=true` is
//! persisted but never gets a driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use mcp_protocol::{HealthSnapshot, McpError, ServerSpec, Transport};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::retry::RetrySupervisor;
use crate::store::SpecStore;
use crate::transport::{Driver, SseDriver, StdioDriver, StreamableHttpDriver, DEFAULT_HANDSHAKE_TIMEOUT};

/// Per-transport handshake timeouts, sourced from [`RuntimeConfig`] so the
/// registry never has to reach for a hard-coded constant when it actually
/// opens a connection.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    pub stdio_startup: Duration,
    pub sse_handshake: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            stdio_startup: DEFAULT_HANDSHAKE_TIMEOUT,
            sse_handshake: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl From<&RuntimeConfig> for HandshakeTimeouts {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            stdio_startup: config.stdio_startup_timeout,
            sse_handshake: config.sse_handshake_timeout,
        }
    }
}

pub struct ServerRegistry {
    store: Arc<dyn SpecStore>,
    retry: Arc<RetrySupervisor>,
    drivers: DashMap<String, Arc<dyn Driver>>,
    specs: DashMap<String, ServerSpec>,
    shutting_down: AtomicBool,
    timeouts: HandshakeTimeouts,
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn SpecStore>, timeouts: HandshakeTimeouts) -> Self {
        Self {
            store,
            retry: Arc::new(RetrySupervisor::new()),
            drivers: DashMap::new(),
            specs: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            timeouts,
        }
    }

    /// Load every persisted spec into memory without connecting; callers
    /// decide whether to eagerly `register` each one.
    pub async fn hydrate(&self) -> Result<(), McpError> {
        for spec in self.store.list().await? {
            self.specs.insert(spec.id.clone(), spec);
        }
        Ok(())
    }

    /// Register a server: persist its spec, connect a driver, and reset
    /// its retry state. If a driver already exists for this id it is shut
    /// down first so only one ever runs at a time. A spec with
    /// `disabled=true` is persisted and tracked but gets no driver.
    pub async fn register(&self, mut spec: ServerSpec) -> Result<(), McpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::ShuttingDown);
        }
        spec.touch();
        self.store.save(&spec).await?;
        if let Some((_, old)) = self.drivers.remove(&spec.id) {
            warn!(server = %spec.id, "re-registering over a live driver, shutting old one down first");
            let _ = old.shutdown().await;
        }
        self.retry.reset(&spec.id);
        if spec.disabled {
            self.specs.insert(spec.id.clone(), spec.clone());
            info!(server = %spec.id, "registered disabled, no driver started");
            return Ok(());
        }
        let driver = connect(&spec, &self.timeouts).await?;
        self.drivers.insert(spec.id.clone(), driver);
        self.specs.insert(spec.id.clone(), spec.clone());
        info!(server = %spec.id, "registered");
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<(), McpError> {
        if let Some((_, driver)) = self.drivers.remove(id) {
            let _ = driver.shutdown().await;
        }
        self.specs.remove(id);
        self.retry.forget(id);
        self.store.delete(id).await?;
        info!(server = %id, "unregistered");
        Ok(())
    }

    /// Mark a server disabled: flips its spec's `disabled` flag, persists
    /// it, and closes whatever driver is currently live. Distinct from
    /// [`ServerRegistry::shutdown`], which tears down every driver at once
    /// for process exit; this acts on one server and leaves its spec
    /// registered (just undriven) for a future re-enable.
    pub async fn disable(&self, id: &str) -> Result<(), McpError> {
        let mut spec = self.get_spec(id)?;
        spec.disabled = true;
        spec.touch();
        self.store.save(&spec).await?;
        self.specs.insert(id.to_string(), spec);
        if let Some((_, driver)) = self.drivers.remove(id) {
            let _ = driver.shutdown().await;
        }
        info!(server = %id, "disabled");
        Ok(())
    }

    /// Fetch the live driver for `id`, honoring the retry backoff window.
    pub fn get_client(&self, id: &str) -> Result<Arc<dyn Driver>, McpError> {
        if !self.specs.contains_key(id) {
            return Err(McpError::ServerNotFound(id.to_string()));
        }
        if self.retry.consecutive_failures(id) >= mcp_protocol::RetryState::MAX_CONSECUTIVE_FAILURES {
            return Err(McpError::RetryExhausted(id.to_string()));
        }
        if !self.retry.may_attempt(id, SystemTime::now()) {
            return Err(McpError::ServerUnavailable {
                id: id.to_string(),
                next_allowed_at: self
                    .retry
                    .next_allowed_at(id)
                    .unwrap_or_else(SystemTime::now),
            });
        }
        self.drivers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| McpError::ServerUnavailable {
                id: id.to_string(),
                next_allowed_at: self
                    .retry
                    .next_allowed_at(id)
                    .unwrap_or_else(SystemTime::now),
            })
    }

    pub fn get_spec(&self, id: &str) -> Result<ServerSpec, McpError> {
        self.specs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| McpError::ServerNotFound(id.to_string()))
    }

    pub fn list_specs(&self) -> Vec<ServerSpec> {
        self.specs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Every id with a spec that isn't disabled and currently has a
    /// `Ready` driver. Used by the facade to aggregate list ops across
    /// servers.
    pub fn ready_server_ids(&self) -> Vec<String> {
        self.drivers
            .iter()
            .filter(|entry| entry.value().state() == mcp_protocol::DriverState::Ready)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Reconnect a server's driver, respecting the retry supervisor's
    /// backoff window and recording the outcome. A disabled spec refuses
    /// to reconnect; call [`ServerRegistry::register`] with
    /// `disabled: false` first.
    pub async fn reconnect(&self, id: &str) -> Result<(), McpError> {
        let now = SystemTime::now();
        if !self.retry.may_attempt(id, now) {
            return Err(McpError::ServerUnavailable {
                id: id.to_string(),
                next_allowed_at: self.retry.next_allowed_at(id).unwrap_or(now),
            });
        }
        let spec = self.get_spec(id)?;
        if spec.disabled {
            return Err(McpError::ServerNotFound(id.to_string()));
        }
        if let Some((_, old)) = self.drivers.remove(id) {
            let _ = old.shutdown().await;
        }
        match connect(&spec, &self.timeouts).await {
            Ok(driver) => {
                self.drivers.insert(id.to_string(), driver);
                self.retry.record_success(id, now);
                Ok(())
            }
            Err(err) => {
                if self.retry.record_failure(id, now).is_err() {
                    return Err(McpError::RetryExhausted(id.to_string()));
                }
                Err(err)
            }
        }
    }

    pub fn list_health(&self) -> Vec<HealthSnapshot> {
        self.specs
            .iter()
            .map(|entry| {
                let id = entry.key().clone();
                let driver = self.drivers.get(&id);
                let state = driver
                    .as_ref()
                    .map(|d| d.state())
                    .unwrap_or(mcp_protocol::DriverState::Disconnected);
                let stderr_counters = driver.as_ref().map(|d| d.stderr_counters()).unwrap_or_default();
                HealthSnapshot {
                    id: id.clone(),
                    state,
                    last_check_at: SystemTime::now(),
                    consecutive_failures: self.retry.consecutive_failures(&id),
                    next_allowed_at: self.retry.next_allowed_at(&id),
                    stderr_counters,
                }
            })
            .collect()
    }

    /// Shut every live driver down. Idempotent; once called, `register`
    /// refuses new work. Distinct from [`ServerRegistry::disable`], which
    /// only acts on one server and leaves it re-enableable.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.drivers.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, driver)) = self.drivers.remove(&id) {
                let _ = driver.shutdown().await;
            }
        }
        Ok(())
    }
}

async fn connect(spec: &ServerSpec, timeouts: &HandshakeTimeouts) -> Result<Arc<dyn Driver>, McpError> {
    match &spec.transport {
        Transport::Stdio { command, args, env } => {
            let driver =
                StdioDriver::spawn(spec.id.clone(), command, args, env, timeouts.stdio_startup).await?;
            Ok(Arc::new(driver))
        }
        Transport::Sse { url, bearer_env_var } => {
            let driver = SseDriver::spawn(
                spec.id.clone(),
                url,
                bearer_env_var.as_deref(),
                timeouts.sse_handshake,
            )
            .await?;
            Ok(Arc::new(driver))
        }
        Transport::StreamableHttp { url, bearer_env_var } => {
            let driver = StreamableHttpDriver::spawn(
                spec.id.clone(),
                url,
                bearer_env_var.as_deref(),
                timeouts.sse_handshake,
            )
            .await?;
            Ok(Arc::new(driver))
        }
    }
}
