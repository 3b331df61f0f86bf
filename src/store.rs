//! Durable Store
//!
//! Single SQLite database backing the three record families the agent
//! persists across restarts:
//! - `capabilities`: registered capability records (name, description,
//!   source path, parameter schema)
//! - `conversations`: the append-only message log
//! - `tasks`: scheduled items the heartbeat and the task tool operate on
//!
//! Also exposes the raw-query entry point that powers the `execute_sql`
//! built-in: SELECT-like statements return rows as JSON, mutations return
//! the affected row count.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// A registered capability as stored durably
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub name: String,
    pub description: String,
    pub source_path: String,
    /// JSON Schema for the tool parameters (authoritative, not derived from source)
    pub parameter_schema: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One persisted conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    /// Correlation back to the requesting call, for tool results
    pub tool_call_id: Option<String>,
    /// Requested calls, for assistant messages that triggered dispatch
    pub tool_calls: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Task status set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A scheduled item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    pub details: String,
    pub status: TaskStatus,
    /// RFC 3339 due time, UTC-normalized on insert
    pub due_at: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result of an arbitrary query
#[derive(Debug, Clone)]
pub enum QueryOutput {
    Rows(Vec<serde_json::Value>),
    RowsAffected(usize),
}

impl QueryOutput {
    /// Shape for the model: rows as a JSON array, mutations as a count object
    pub fn to_json(&self) -> String {
        match self {
            Self::Rows(rows) => {
                serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string())
            }
            Self::RowsAffected(n) => {
                serde_json::json!({ "rows_affected": n }).to_string()
            }
        }
    }
}

/// SQLite-backed store shared by all turns in the process
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database, for tests
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS capabilities (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                source_path TEXT NOT NULL,
                parameter_schema TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'tool')),
                content TEXT NOT NULL,
                tool_call_id TEXT,
                tool_calls TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_id
                ON conversations(id DESC);

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK(status IN ('pending', 'in_progress', 'done', 'cancelled')),
                due_at TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON tasks(status, due_at);
            "#,
        )?;
        Ok(())
    }

    // ── Capabilities ──

    /// Insert-or-replace a capability record, keyed by name
    pub fn upsert_capability(
        &self,
        name: &str,
        description: &str,
        source_path: &str,
        parameter_schema: &serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn.lock().execute(
            "INSERT INTO capabilities (name, description, source_path, parameter_schema, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 description = excluded.description,
                 source_path = excluded.source_path,
                 parameter_schema = excluded.parameter_schema,
                 updated_at = excluded.updated_at",
            params![name, description, source_path, parameter_schema.to_string(), now],
        )?;
        Ok(())
    }

    /// All registered capability records
    pub fn all_capabilities(&self) -> Result<Vec<CapabilityRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, description, source_path, parameter_schema, created_at, updated_at
             FROM capabilities ORDER BY name",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(
                |(name, description, source_path, schema, created_at, updated_at)| {
                    CapabilityRecord {
                        name,
                        description,
                        source_path,
                        parameter_schema: serde_json::from_str(&schema)
                            .unwrap_or(serde_json::Value::Null),
                        created_at,
                        updated_at,
                    }
                },
            )
            .collect();
        Ok(records)
    }

    /// Look up a single capability record by name
    pub fn get_capability(&self, name: &str) -> Result<Option<CapabilityRecord>> {
        Ok(self
            .all_capabilities()?
            .into_iter()
            .find(|r| r.name == name))
    }

    // ── Conversations ──

    /// Append one message to the conversation log. Never mutates prior rows.
    pub fn append_message(
        &self,
        role: &str,
        content: &str,
        tool_call_id: Option<&str>,
        tool_calls: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (role, content, tool_call_id, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                role,
                content,
                tool_call_id,
                tool_calls.map(|v| v.to_string()),
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent messages, newest first. Callers re-order for the model.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, role, content, tool_call_id, tool_calls, created_at
             FROM conversations ORDER BY id DESC LIMIT ?1",
        )?;
        let messages = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(
                |(id, role, content, tool_call_id, tool_calls, created_at)| StoredMessage {
                    id,
                    role,
                    content,
                    tool_call_id,
                    tool_calls: tool_calls.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at,
                },
            )
            .collect();
        Ok(messages)
    }

    // ── Tasks ──

    /// Create a task; `due_at` accepts any RFC 3339 timestamp
    pub fn create_task(
        &self,
        title: &str,
        details: &str,
        due_at: Option<&str>,
    ) -> Result<TaskRecord> {
        let due = due_at.map(normalize_due_at).transpose()?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (title, details, due_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![title, details, due, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(id)?
            .context("task vanished immediately after insert")
    }

    /// Fetch one task
    pub fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, details, status, due_at, created_at, updated_at
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_task)?;
        Ok(rows.next().transpose()?)
    }

    /// Open (not done/cancelled) tasks, soonest due first
    pub fn list_open_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, details, status, due_at, created_at, updated_at
             FROM tasks WHERE status NOT IN ('done', 'cancelled')
             ORDER BY due_at IS NULL, due_at, id",
        )?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Pending tasks with a due time inside the next `within` window.
    /// Drives the heartbeat: undated tasks never trigger a synthesized turn.
    pub fn due_tasks(&self, within: Duration) -> Result<Vec<TaskRecord>> {
        let cutoff = (Utc::now() + chrono::Duration::from_std(within)?).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, details, status, due_at, created_at, updated_at
             FROM tasks
             WHERE status = 'pending' AND due_at IS NOT NULL AND due_at <= ?1
             ORDER BY due_at, id",
        )?;
        let tasks = stmt
            .query_map(params![cutoff], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Pending tasks for turn context: due within `horizon` or undated
    pub fn context_tasks(&self, horizon: Duration, limit: usize) -> Result<Vec<TaskRecord>> {
        let cutoff = (Utc::now() + chrono::Duration::from_std(horizon)?).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, details, status, due_at, created_at, updated_at
             FROM tasks
             WHERE status = 'pending' AND (due_at IS NULL OR due_at <= ?1)
             ORDER BY due_at IS NULL, due_at, id LIMIT ?2",
        )?;
        let tasks = stmt
            .query_map(params![cutoff, limit as i64], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Partial update; `None` fields are left untouched
    pub fn update_task(
        &self,
        id: i64,
        title: Option<&str>,
        details: Option<&str>,
        status: Option<TaskStatus>,
        due_at: Option<&str>,
    ) -> Result<Option<TaskRecord>> {
        let due = due_at.map(normalize_due_at).transpose()?;
        let now = Utc::now().timestamp();
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE tasks SET
                     title = COALESCE(?2, title),
                     details = COALESCE(?3, details),
                     status = COALESCE(?4, status),
                     due_at = COALESCE(?5, due_at),
                     updated_at = ?6
                 WHERE id = ?1",
                params![id, title, details, status.map(|s| s.as_str()), due, now],
            )?;
        }
        self.get_task(id)
    }

    /// Delete a task, returning how many rows went away
    pub fn delete_task(&self, id: i64) -> Result<usize> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(n)
    }

    // ── Raw queries ──

    /// Execute arbitrary SQL. Statements that produce columns are read as
    /// rows; everything else reports the affected row count. Effects are the
    /// caller's responsibility.
    pub fn raw_query(&self, sql: &str) -> Result<QueryOutput> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;

        if stmt.column_count() == 0 {
            let n = stmt.execute([])?;
            return Ok(QueryOutput::RowsAffected(n));
        }

        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => serde_json::Value::from(v),
                    rusqlite::types::ValueRef::Real(v) => serde_json::Value::from(v),
                    rusqlite::types::ValueRef::Text(v) => {
                        serde_json::Value::from(String::from_utf8_lossy(v).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(v) => {
                        serde_json::Value::from(format!("<{} bytes>", v.len()))
                    }
                };
                obj.insert(name.clone(), value);
            }
            out.push(serde_json::Value::Object(obj));
        }
        Ok(QueryOutput::Rows(out))
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(3)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        details: row.get(2)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        due_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Normalize any RFC 3339 timestamp to UTC so stored strings compare correctly
fn normalize_due_at(s: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid due_at timestamp: {s}"))?;
    Ok(parsed.with_timezone(&Utc).to_rfc3339())
}
