//! Engine-agnostic persistence for `ServerSpec` rows, backed by
//! `sqlx`'s `Any` driver so the same code speaks SQLite or MySQL. Three
//! tables: `mcp_servers` (one row per server, tool filter as JSON), plus
//! `mcp_server_args` and `mcp_server_env` for a stdio transport's argv/env,
//! since those are naturally variable-length.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcp_protocol::{McpError, ServerSpec, ToolFilter, Transport};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn save(&self, spec: &ServerSpec) -> Result<(), McpError>;
    async fn load(&self, id: &str) -> Result<Option<ServerSpec>, McpError>;
    async fn list(&self) -> Result<Vec<ServerSpec>, McpError>;
    async fn delete(&self, id: &str) -> Result<(), McpError>;
}

pub struct SqlSpecStore {
    pool: AnyPool,
}

impl SqlSpecStore {
    pub async fn connect(database_url: &str) -> Result<Self, McpError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| McpError::Transport {
                id: "store".to_string(),
                message: format!("failed to connect to `{database_url}`: {err}"),
            })?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), McpError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcp_servers (\
                id TEXT PRIMARY KEY,\
                name TEXT,\
                description TEXT,\
                type TEXT NOT NULL,\
                url TEXT,\
                command TEXT,\
                bearer_env_var TEXT,\
                tool_filter_json TEXT NOT NULL,\
                timeout INTEGER NOT NULL,\
                disabled INTEGER NOT NULL,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcp_server_args (\
                server_id TEXT NOT NULL,\
                position INTEGER NOT NULL,\
                value TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mcp_server_env (\
                server_id TEXT NOT NULL,\
                key TEXT NOT NULL,\
                value TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sql_err)?;

        Ok(())
    }

    fn row_to_spec(row: &AnyRow, args: Vec<String>, env: Vec<(String, String)>) -> Result<ServerSpec, McpError> {
        let id: String = row.try_get("id").map_err(map_sql_err)?;
        let name: Option<String> = row.try_get("name").map_err(map_sql_err)?;
        let description: Option<String> = row.try_get("description").map_err(map_sql_err)?;
        let kind: String = row.try_get("type").map_err(map_sql_err)?;
        let url: Option<String> = row.try_get("url").map_err(map_sql_err)?;
        let command: Option<String> = row.try_get("command").map_err(map_sql_err)?;
        let bearer_env_var: Option<String> = row.try_get("bearer_env_var").map_err(map_sql_err)?;
        let tool_filter_json: String = row.try_get("tool_filter_json").map_err(map_sql_err)?;
        let tool_filter: ToolFilter = serde_json::from_str(&tool_filter_json)?;
        let timeout_seconds: i64 = row.try_get("timeout").map_err(map_sql_err)?;
        let disabled: i64 = row.try_get("disabled").map_err(map_sql_err)?;
        let created_at: String = row.try_get("created_at").map_err(map_sql_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(map_sql_err)?;

        let transport = match kind.as_str() {
            "stdio" => Transport::Stdio {
                command: command.ok_or_else(|| missing_column(&id, "command"))?,
                args,
                env,
            },
            "sse" => Transport::Sse {
                url: url.ok_or_else(|| missing_column(&id, "url"))?,
                bearer_env_var,
            },
            "streamable_http" => Transport::StreamableHttp {
                url: url.ok_or_else(|| missing_column(&id, "url"))?,
                bearer_env_var,
            },
            other => {
                return Err(McpError::Protocol {
                    id: id.clone(),
                    message: format!("unknown persisted transport kind `{other}`"),
                })
            }
        };

        Ok(ServerSpec {
            id,
            name,
            description,
            transport,
            tool_filter,
            timeout_seconds: timeout_seconds as u64,
            disabled: disabled != 0,
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
        })
    }
}

fn missing_column(id: &str, column: &str) -> McpError {
    McpError::Protocol {
        id: id.to_string(),
        message: format!("persisted row is missing `{column}` for its transport kind"),
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, McpError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| McpError::Protocol {
            id: "store".to_string(),
            message: format!("malformed timestamp `{value}`: {err}"),
        })
}

fn map_sql_err(err: sqlx::Error) -> McpError {
    McpError::Transport {
        id: "store".to_string(),
        message: format!("sql error: {err}"),
    }
}

#[async_trait]
impl SpecStore for SqlSpecStore {
    async fn save(&self, spec: &ServerSpec) -> Result<(), McpError> {
        let (kind, url, command, bearer_env_var, args, env): (
            &str,
            Option<&str>,
            Option<&str>,
            Option<&str>,
            Vec<String>,
            Vec<(String, String)>,
        ) = match &spec.transport {
            Transport::Stdio { command, args, env } => {
                ("stdio", None, Some(command.as_str()), None, args.clone(), env.clone())
            }
            Transport::Sse { url, bearer_env_var } => (
                "sse",
                Some(url.as_str()),
                None,
                bearer_env_var.as_deref(),
                Vec::new(),
                Vec::new(),
            ),
            Transport::StreamableHttp { url, bearer_env_var } => (
                "streamable_http",
                Some(url.as_str()),
                None,
                bearer_env_var.as_deref(),
                Vec::new(),
                Vec::new(),
            ),
        };
        let tool_filter_json = serde_json::to_string(&spec.tool_filter)?;
        let created_at = spec.created_at.to_rfc3339();
        let updated_at = spec.updated_at.to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(map_sql_err)?;

        sqlx::query(
            "INSERT INTO mcp_servers \
             (id, name, description, type, url, command, bearer_env_var, tool_filter_json, timeout, disabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
             type = excluded.type, url = excluded.url, command = excluded.command, \
             bearer_env_var = excluded.bearer_env_var, tool_filter_json = excluded.tool_filter_json, \
             timeout = excluded.timeout, disabled = excluded.disabled, updated_at = excluded.updated_at",
        )
        .bind(&spec.id)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(kind)
        .bind(url)
        .bind(command)
        .bind(bearer_env_var)
        .bind(&tool_filter_json)
        .bind(spec.timeout_seconds as i64)
        .bind(spec.disabled as i64)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sql_err)?;

        sqlx::query("DELETE FROM mcp_server_args WHERE server_id = ?")
            .bind(&spec.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;
        for (position, value) in args.iter().enumerate() {
            sqlx::query("INSERT INTO mcp_server_args (server_id, position, value) VALUES (?, ?, ?)")
                .bind(&spec.id)
                .bind(position as i64)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;
        }

        sqlx::query("DELETE FROM mcp_server_env WHERE server_id = ?")
            .bind(&spec.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;
        for (key, value) in env.iter() {
            sqlx::query("INSERT INTO mcp_server_env (server_id, key, value) VALUES (?, ?, ?)")
                .bind(&spec.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;
        }

        tx.commit().await.map_err(map_sql_err)?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ServerSpec>, McpError> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql_err)?;
        let Some(row) = row else { return Ok(None) };

        let args = load_args(&self.pool, id).await?;
        let env = load_env(&self.pool, id).await?;
        Ok(Some(Self::row_to_spec(&row, args, env)?))
    }

    async fn list(&self) -> Result<Vec<ServerSpec>, McpError> {
        let rows = sqlx::query("SELECT * FROM mcp_servers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_err)?;
        let mut specs = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(map_sql_err)?;
            let args = load_args(&self.pool, &id).await?;
            let env = load_env(&self.pool, &id).await?;
            specs.push(Self::row_to_spec(row, args, env)?);
        }
        Ok(specs)
    }

    async fn delete(&self, id: &str) -> Result<(), McpError> {
        sqlx::query("DELETE FROM mcp_servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
        sqlx::query("DELETE FROM mcp_server_args WHERE server_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
        sqlx::query("DELETE FROM mcp_server_env WHERE server_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
        Ok(())
    }
}

async fn load_args(pool: &AnyPool, server_id: &str) -> Result<Vec<String>, McpError> {
    let rows = sqlx::query("SELECT value FROM mcp_server_args WHERE server_id = ? ORDER BY position")
        .bind(server_id)
        .fetch_all(pool)
        .await
        .map_err(map_sql_err)?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("value").map_err(map_sql_err))
        .collect()
}

async fn load_env(pool: &AnyPool, server_id: &str) -> Result<Vec<(String, String)>, McpError> {
    let rows = sqlx::query("SELECT key, value FROM mcp_server_env WHERE server_id = ?")
        .bind(server_id)
        .fetch_all(pool)
        .await
        .map_err(map_sql_err)?;
    rows.iter()
        .map(|row| {
            let key: String = row.try_get("key").map_err(map_sql_err)?;
            let value: String = row.try_get("value").map_err(map_sql_err)?;
            Ok((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_stdio_spec_through_sqlite() {
        let store = SqlSpecStore::connect("sqlite::memory:").await.unwrap();
        let spec = ServerSpec::new(
            "fs",
            Transport::Stdio {
                command: "mcp-server-filesystem".to_string(),
                args: vec!["--root".to_string(), "/tmp".to_string()],
                env: vec![("LOG_LEVEL".to_string(), "debug".to_string())],
            },
        )
        .with_name("Filesystem")
        .with_description("Local filesystem access")
        .with_timeout_seconds(90);
        store.save(&spec).await.unwrap();

        let loaded = store.load("fs").await.unwrap().expect("spec was saved");
        assert_eq!(loaded, spec);
    }

    #[tokio::test]
    async fn list_returns_every_saved_server() {
        let store = SqlSpecStore::connect("sqlite::memory:").await.unwrap();
        store
            .save(&ServerSpec::new(
                "a",
                Transport::Sse {
                    url: "https://example.test/sse".to_string(),
                    bearer_env_var: None,
                },
            ))
            .await
            .unwrap();
        store
            .save(&ServerSpec::new(
                "b",
                Transport::StreamableHttp {
                    url: "https://example.test/mcp".to_string(),
                    bearer_env_var: Some("EXAMPLE_TOKEN".to_string()),
                },
            ))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_server_and_its_args() {
        let store = SqlSpecStore::connect("sqlite::memory:").await.unwrap();
        let spec = ServerSpec::new(
            "fs",
            Transport::Stdio {
                command: "mcp-server-filesystem".to_string(),
                args: vec!["--root".to_string(), "/tmp".to_string()],
                env: vec![],
            },
        );
        store.save(&spec).await.unwrap();
        store.delete("fs").await.unwrap();
        assert!(store.load("fs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_disabled_flag_round_trips_through_sqlite() {
        let store = SqlSpecStore::connect("sqlite::memory:").await.unwrap();
        let spec = ServerSpec::new(
            "fs",
            Transport::Stdio {
                command: "mcp-server-filesystem".to_string(),
                args: vec![],
                env: vec![],
            },
        )
        .with_disabled(true);
        store.save(&spec).await.unwrap();

        let loaded = store.load("fs").await.unwrap().expect("spec was saved");
        assert!(loaded.disabled);
    }
}
