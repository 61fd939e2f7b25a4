//! SQLite persistence for locally registered tools and downstream servers.
//!
//! Uses `rusqlite` in synchronous mode; calls are short single-row writes
//! made while the registry holds its write lock. Discovered catalogs are
//! not persisted; they are rebuilt by discovery.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::errors::ProxyError;
use super::types::{InputSchema, Tool, ToolKind, ToolOrigin};
use crate::mcp_client::ServerDescriptor;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the registry.
pub struct RegistryStore {
    conn: Connection,
}

impl RegistryStore {
    /// Open (or create) the registry database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, ProxyError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), ProxyError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tools (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                entry_point TEXT NOT NULL,
                authentication TEXT,
                env TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                input_schema TEXT NOT NULL DEFAULT '{}',
                timeout_ms INTEGER,
                registered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    /// Insert a local tool. Fails if the id already exists.
    pub fn insert_tool(&self, tool: &Tool) -> Result<(), ProxyError> {
        let kind = tool.kind.ok_or_else(|| ProxyError::Storage {
            reason: format!("tool '{}' has no kind and cannot be persisted", tool.id),
        })?;
        let authentication = tool
            .authentication
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO tools (id, name, description, kind, entry_point, authentication,
                                env, enabled, input_schema, timeout_ms, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                tool.id,
                tool.name,
                tool.description,
                kind.as_str(),
                tool.entry_point,
                authentication,
                serde_json::to_string(&tool.env)?,
                tool.enabled,
                serde_json::to_string(&tool.input_schema)?,
                tool.timeout_ms.map(|t| t as i64),
                tool.registered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Set a tool's enabled flag. Returns `false` if no such row.
    pub fn set_tool_enabled(&self, tool_id: &str, enabled: bool) -> Result<bool, ProxyError> {
        let changed = self.conn.execute(
            "UPDATE tools SET enabled = ?1 WHERE id = ?2",
            params![enabled, tool_id],
        )?;
        Ok(changed > 0)
    }

    /// Replace a tool's environment map. Returns `false` if no such row.
    pub fn update_tool_env(
        &self,
        tool_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<bool, ProxyError> {
        let changed = self.conn.execute(
            "UPDATE tools SET env = ?1 WHERE id = ?2",
            params![serde_json::to_string(env)?, tool_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a tool. Returns `false` if no such row.
    pub fn delete_tool(&self, tool_id: &str) -> Result<bool, ProxyError> {
        let changed = self
            .conn
            .execute("DELETE FROM tools WHERE id = ?1", params![tool_id])?;
        Ok(changed > 0)
    }

    /// Load every persisted tool. Rows that no longer parse are skipped.
    pub fn load_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, kind, entry_point, authentication, env,
                    enabled, input_schema, timeout_ms, registered_at
             FROM tools ORDER BY registered_at",
        )?;
        let rows = stmt.query_map([], row_to_tool)?;

        let mut tools = Vec::new();
        for row in rows {
            match row? {
                Ok(tool) => tools.push(tool),
                Err(reason) => tracing::warn!(%reason, "skipping unreadable tool row"),
            }
        }
        Ok(tools)
    }

    // ─── Servers ────────────────────────────────────────────────────────

    /// Insert or replace a server descriptor.
    pub fn upsert_server(
        &self,
        server_id: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<(), ProxyError> {
        self.conn.execute(
            "INSERT INTO servers (id, descriptor) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET descriptor = excluded.descriptor",
            params![server_id, serde_json::to_string(descriptor)?],
        )?;
        Ok(())
    }

    /// Delete a server. Returns `false` if no such row.
    pub fn delete_server(&self, server_id: &str) -> Result<bool, ProxyError> {
        let changed = self
            .conn
            .execute("DELETE FROM servers WHERE id = ?1", params![server_id])?;
        Ok(changed > 0)
    }

    /// Load every persisted server descriptor.
    pub fn load_servers(&self) -> Result<Vec<(String, ServerDescriptor)>, ProxyError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, descriptor FROM servers ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut servers = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            match serde_json::from_str::<ServerDescriptor>(&raw) {
                Ok(descriptor) => servers.push((id, descriptor)),
                Err(e) => tracing::warn!(server = %id, error = %e, "skipping unreadable server row"),
            }
        }
        Ok(servers)
    }

    // ─── Maintenance ────────────────────────────────────────────────────

    /// Whether any tool or server is persisted.
    pub fn has_data(&self) -> Result<bool, ProxyError> {
        let count: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM tools) + (SELECT COUNT(*) FROM servers)",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete all tools and servers.
    pub fn clear(&self) -> Result<(), ProxyError> {
        self.conn
            .execute_batch("DELETE FROM tools; DELETE FROM servers;")?;
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Map a row to a tool. The inner `Err` carries a reason for rows whose
/// stored values no longer parse.
fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<Result<Tool, String>> {
    let id: String = row.get(0)?;
    let kind_raw: String = row.get(3)?;
    let auth_raw: Option<String> = row.get(5)?;
    let env_raw: String = row.get(6)?;
    let schema_raw: String = row.get(8)?;
    let timeout_ms: Option<i64> = row.get(9)?;
    let registered_raw: String = row.get(10)?;

    let kind = match kind_raw.parse::<ToolKind>() {
        Ok(kind) => kind,
        Err(e) => return Ok(Err(format!("tool '{id}': {e}"))),
    };
    let registered_at = match DateTime::parse_from_rfc3339(&registered_raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => return Ok(Err(format!("tool '{id}': bad timestamp: {e}"))),
    };

    Ok(Ok(Tool {
        name: row.get(1)?,
        description: row.get(2)?,
        kind: Some(kind),
        entry_point: row.get(4)?,
        authentication: auth_raw.map(parse_json_value),
        env: serde_json::from_str(&env_raw).unwrap_or_default(),
        enabled: row.get(7)?,
        origin: ToolOrigin::Local,
        input_schema: serde_json::from_str::<InputSchema>(&schema_raw).unwrap_or_default(),
        timeout_ms: timeout_ms.and_then(|t| u64::try_from(t).ok()),
        registered_at,
        id,
    }))
}

/// Parse a JSON string into a serde_json::Value, defaulting to null.
fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{HttpServerConfig, ServerConfig};

    fn sample_tool(id: &str) -> Tool {
        Tool {
            id: id.into(),
            name: "echo".into(),
            description: "Echo input".into(),
            kind: Some(ToolKind::Python),
            entry_point: "/opt/tools/echo.py".into(),
            authentication: Some(serde_json::json!({"token": "s3cret"})),
            env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
            enabled: true,
            origin: ToolOrigin::Local,
            input_schema: InputSchema {
                required: vec!["text".into()],
                ..Default::default()
            },
            timeout_ms: Some(5_000),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_tool_persist_and_reload() {
        let db = RegistryStore::open(":memory:").unwrap();
        let tool = sample_tool("t1");
        db.insert_tool(&tool).unwrap();

        let loaded = db.load_tools().unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, "t1");
        assert_eq!(got.kind, Some(ToolKind::Python));
        assert_eq!(got.authentication, tool.authentication);
        assert_eq!(got.env.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(got.input_schema.required, vec!["text".to_string()]);
        assert_eq!(got.timeout_ms, Some(5_000));
        assert!(got.enabled);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let db = RegistryStore::open(":memory:").unwrap();
        db.insert_tool(&sample_tool("t1")).unwrap();
        let err = db.insert_tool(&sample_tool("t1")).unwrap_err();
        assert!(matches!(err, ProxyError::Storage { .. }));
    }

    #[test]
    fn test_update_and_delete_report_missing_rows() {
        let db = RegistryStore::open(":memory:").unwrap();
        db.insert_tool(&sample_tool("t1")).unwrap();

        assert!(db.set_tool_enabled("t1", false).unwrap());
        assert!(!db.set_tool_enabled("nope", false).unwrap());
        assert!(!db.load_tools().unwrap()[0].enabled);

        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert!(db.update_tool_env("t1", &env).unwrap());
        assert_eq!(db.load_tools().unwrap()[0].env, env);

        assert!(db.delete_tool("t1").unwrap());
        assert!(!db.delete_tool("t1").unwrap());
        assert!(db.load_tools().unwrap().is_empty());
    }

    #[test]
    fn test_servers_round_trip_and_clear() {
        let db = RegistryStore::open(":memory:").unwrap();
        assert!(!db.has_data().unwrap());
        let stdio = ServerDescriptor::Stdio(ServerConfig {
            command: "npx".into(),
            args: vec!["-y".into(), "server-files".into()],
            env: BTreeMap::new(),
            cwd: None,
        });
        let http = ServerDescriptor::Http(HttpServerConfig {
            url: "http://localhost:9000/mcp".into(),
            headers: BTreeMap::new(),
        });
        db.upsert_server("files", &stdio).unwrap();
        assert!(db.has_data().unwrap());
        db.upsert_server("web", &http).unwrap();
        db.upsert_server("files", &http).unwrap();

        let servers = db.load_servers().unwrap();
        assert_eq!(servers.len(), 2);
        let files = servers.iter().find(|(id, _)| id == "files").unwrap();
        assert_eq!(files.1, http);

        db.insert_tool(&sample_tool("t1")).unwrap();
        db.clear().unwrap();
        assert!(!db.has_data().unwrap());
        assert!(db.load_servers().unwrap().is_empty());
        assert!(db.load_tools().unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_rows_are_skipped() {
        let db = RegistryStore::open(":memory:").unwrap();
        db.insert_tool(&sample_tool("good")).unwrap();
        db.conn
            .execute(
                "INSERT INTO tools (id, name, kind, entry_point, registered_at)
                 VALUES ('bad', 'x', 'ruby', 'x.rb', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let tools = db.load_tools().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "good");
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let path = path.to_str().unwrap();
        {
            let db = RegistryStore::open(path).unwrap();
            db.insert_tool(&sample_tool("t1")).unwrap();
        }
        let db = RegistryStore::open(path).unwrap();
        assert_eq!(db.load_tools().unwrap().len(), 1);
    }
}
