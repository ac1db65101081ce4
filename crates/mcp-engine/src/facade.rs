//! RPC facade: the gRPC-shaped surface callers actually use.
//! Thin over [`ServerRegistry`] — its job is applying the tool allow/deny
//! filter, stamping `server_name` onto aggregated listings, and mapping
//! driver errors onto a stable error taxonomy, not reimplementing
//! transport logic. Every op takes the caller's own deadline rather than a
//! timeout fixed at construction, so a dispatch loop can pass down
//! whatever turn budget remains.

use std::sync::Arc;
use std::time::Duration;

use mcp_protocol::{CallToolResult, HealthSnapshot, McpError, Prompt, Resource, ServerSpec, Tool};
use serde_json::Value;
use tracing::warn;

use crate::registry::ServerRegistry;

pub struct McpFacade {
    registry: Arc<ServerRegistry>,
}

impl McpFacade {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn register(&self, spec: ServerSpec) -> Result<(), McpError> {
        self.registry.register(spec).await
    }

    pub async fn unregister(&self, id: &str) -> Result<(), McpError> {
        self.registry.unregister(id).await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<CallToolResult, McpError> {
        let spec = self.registry.get_spec(server_id)?;
        if !spec.tool_filter.allows(tool_name) {
            return Err(McpError::Tool {
                code: -32601,
                message: format!("tool `{tool_name}` is not enabled for server `{server_id}`"),
                data: None,
            });
        }
        let driver = self.registry.get_client(server_id)?;
        tokio::time::timeout(deadline, driver.call_tool(tool_name, arguments))
            .await
            .map_err(|_| McpError::CallTimeout(deadline))?
    }

    /// List tools for one server, or aggregate across every ready server
    /// when `server_id` is absent. Aggregation never aborts on a single
    /// server's failure — it logs a warning for that id and continues.
    pub async fn list_tools(
        &self,
        server_id: Option<&str>,
        deadline: Duration,
    ) -> Result<Vec<Tool>, McpError> {
        match server_id {
            Some(id) => self.list_tools_for(id, deadline).await,
            None => {
                let mut aggregated = Vec::new();
                for id in self.registry.ready_server_ids() {
                    match self.list_tools_for(&id, deadline).await {
                        Ok(tools) => aggregated.extend(tools),
                        Err(err) => warn!(server = %id, %err, "skipping server in tools aggregation"),
                    }
                }
                Ok(aggregated)
            }
        }
    }

    async fn list_tools_for(&self, server_id: &str, deadline: Duration) -> Result<Vec<Tool>, McpError> {
        let spec = self.registry.get_spec(server_id)?;
        let driver = self.registry.get_client(server_id)?;
        let raw = tokio::time::timeout(deadline, driver.list_tools())
            .await
            .map_err(|_| McpError::CallTimeout(deadline))??;
        let tools: Vec<Tool> = serde_json::from_value(raw.get("tools").cloned().unwrap_or(Value::Null))
            .map_err(McpError::from)?;
        Ok(tools
            .into_iter()
            .filter(|tool| spec.tool_filter.allows(&tool.name))
            .map(|mut tool| {
                tool.server_name = server_id.to_string();
                tool
            })
            .collect())
    }

    /// List resources for one server, or aggregate across every ready
    /// server when `server_id` is absent, with the same per-id-warning
    /// failure handling as [`McpFacade::list_tools`].
    pub async fn list_resources(
        &self,
        server_id: Option<&str>,
        deadline: Duration,
    ) -> Result<Vec<Resource>, McpError> {
        match server_id {
            Some(id) => self.list_resources_for(id, deadline).await,
            None => {
                let mut aggregated = Vec::new();
                for id in self.registry.ready_server_ids() {
                    match self.list_resources_for(&id, deadline).await {
                        Ok(resources) => aggregated.extend(resources),
                        Err(err) => warn!(server = %id, %err, "skipping server in resources aggregation"),
                    }
                }
                Ok(aggregated)
            }
        }
    }

    async fn list_resources_for(&self, server_id: &str, deadline: Duration) -> Result<Vec<Resource>, McpError> {
        let driver = self.registry.get_client(server_id)?;
        let raw = tokio::time::timeout(deadline, driver.list_resources())
            .await
            .map_err(|_| McpError::CallTimeout(deadline))??;
        let resources: Vec<Resource> =
            serde_json::from_value(raw.get("resources").cloned().unwrap_or(Value::Null))
                .map_err(McpError::from)?;
        Ok(resources
            .into_iter()
            .map(|mut resource| {
                resource.server_name = server_id.to_string();
                resource
            })
            .collect())
    }

    /// List prompts for one server, or aggregate across every ready
    /// server when `server_id` is absent, with the same per-id-warning
    /// failure handling as [`McpFacade::list_tools`].
    pub async fn list_prompts(
        &self,
        server_id: Option<&str>,
        deadline: Duration,
    ) -> Result<Vec<Prompt>, McpError> {
        match server_id {
            Some(id) => self.list_prompts_for(id, deadline).await,
            None => {
                let mut aggregated = Vec::new();
                for id in self.registry.ready_server_ids() {
                    match self.list_prompts_for(&id, deadline).await {
                        Ok(prompts) => aggregated.extend(prompts),
                        Err(err) => warn!(server = %id, %err, "skipping server in prompts aggregation"),
                    }
                }
                Ok(aggregated)
            }
        }
    }

    async fn list_prompts_for(&self, server_id: &str, deadline: Duration) -> Result<Vec<Prompt>, McpError> {
        let driver = self.registry.get_client(server_id)?;
        let raw = tokio::time::timeout(deadline, driver.list_prompts())
            .await
            .map_err(|_| McpError::CallTimeout(deadline))??;
        let prompts: Vec<Prompt> = serde_json::from_value(raw.get("prompts").cloned().unwrap_or(Value::Null))
            .map_err(McpError::from)?;
        Ok(prompts
            .into_iter()
            .map(|mut prompt| {
                prompt.server_name = server_id.to_string();
                prompt
            })
            .collect())
    }

    pub fn get_health(&self, server_id: &str) -> Result<HealthSnapshot, McpError> {
        self.registry
            .list_health()
            .into_iter()
            .find(|snapshot| snapshot.id == server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))
    }

    pub fn list_health(&self) -> Vec<HealthSnapshot> {
        self.registry.list_health()
    }

    pub async fn reconnect(&self, server_id: &str) -> Result<(), McpError> {
        self.registry.reconnect(server_id).await
    }

    /// Acknowledge and disable one server: marks its spec `disabled = true`
    /// and closes its driver. Distinct from [`McpFacade::shutdown`], which
    /// tears every registered server down at once for process exit.
    pub async fn shutdown_server(&self, server_id: &str) -> Result<(), McpError> {
        self.registry.disable(server_id).await
    }

    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.registry.shutdown().await
    }
}
