//! Built-in Tools
//!
//! The fixed tool set that is always present regardless of registry state:
//! `execute_sql`, `write_capability`, `manage_tasks`, and `restart`. Their
//! names are reserved words in the catalog namespace.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::capability::{CapabilityRegistry, Validator};
use crate::restart::{RestartSignal, RESTART_EXIT_CODE};
use crate::store::{Store, TaskStatus};
use crate::tools::Tool;

/// Reserved names; capability registration rejects collisions with these
pub const BUILTIN_TOOL_NAMES: &[&str] =
    &["execute_sql", "write_capability", "manage_tasks", "restart"];

/// Construct the full built-in set
pub fn builtin_tools(
    store: Arc<Store>,
    validator: Arc<Validator>,
    registry: Arc<CapabilityRegistry>,
    restart: Arc<RestartSignal>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SqlTool { store: Arc::clone(&store) }),
        Arc::new(WriteCapabilityTool { validator }),
        Arc::new(ManageTasksTool { store }),
        Arc::new(RestartTool { registry, restart }),
    ]
}

// ── execute_sql ──

/// Arbitrary query execution against the agent's own database
pub struct SqlTool {
    store: Arc<Store>,
}

#[derive(Deserialize)]
struct SqlParams {
    query: String,
}

#[async_trait]
impl Tool for SqlTool {
    fn name(&self) -> &str {
        "execute_sql"
    }

    fn description(&self) -> &str {
        "Execute an arbitrary SQL query against the database. \
         Returns rows as JSON for SELECT, or row count for mutations."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "SQL query to execute"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let params: SqlParams = serde_json::from_value(args)?;
        Ok(self.store.raw_query(&params.query)?.to_json())
    }
}

// ── write_capability ──

/// Self-extension: author a capability, run it through the validation
/// pipeline, and hot-register it on success
pub struct WriteCapabilityTool {
    validator: Arc<Validator>,
}

#[derive(Deserialize)]
struct WriteCapabilityParams {
    name: String,
    description: String,
    code: String,
    parameters_schema: serde_json::Value,
}

#[async_trait]
impl Tool for WriteCapabilityTool {
    fn name(&self) -> &str {
        "write_capability"
    }

    fn description(&self) -> &str {
        "Write a new capability as a Rhai script, register it, and hot-load it. \
         The code must define exactly one function with the same name as the \
         capability that accepts a single params map and returns a string."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Snake_case name for the capability; becomes the function and file name"
                },
                "description": {
                    "type": "string",
                    "description": "What this capability does, shown to the model as the tool description"
                },
                "code": {
                    "type": "string",
                    "description": "Full Rhai source code for the capability script"
                },
                "parameters_schema": {
                    "type": "object",
                    "description": "JSON Schema for the tool parameters"
                }
            },
            "required": ["name", "description", "code", "parameters_schema"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let params: WriteCapabilityParams = serde_json::from_value(args)?;
        let outcome = self
            .validator
            .register(
                &params.name,
                &params.description,
                &params.code,
                &params.parameters_schema,
            )
            .await?;
        Ok(outcome.to_json())
    }
}

// ── manage_tasks ──

/// Scheduled-item CRUD
pub struct ManageTasksTool {
    store: Arc<Store>,
}

#[derive(Deserialize)]
struct ManageTasksParams {
    action: String,
    id: Option<i64>,
    title: Option<String>,
    details: Option<String>,
    status: Option<String>,
    due_at: Option<String>,
}

#[async_trait]
impl Tool for ManageTasksTool {
    fn name(&self) -> &str {
        "manage_tasks"
    }

    fn description(&self) -> &str {
        "Create, list, get, update, complete, or delete tasks. Returns task data as JSON."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "list", "get", "update", "complete", "delete"],
                    "description": "The action to perform"
                },
                "id": {"type": "integer", "description": "Task ID"},
                "title": {"type": "string", "description": "Task title"},
                "details": {"type": "string", "description": "Task details"},
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "done", "cancelled"],
                    "description": "New status"
                },
                "due_at": {"type": "string", "description": "Due date as RFC 3339 string"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let p: ManageTasksParams = serde_json::from_value(args)?;

        let result = match p.action.as_str() {
            "create" => {
                let Some(ref title) = p.title else {
                    return Ok(json!({"error": "title is required for create"}).to_string());
                };
                let task = self.store.create_task(
                    title,
                    p.details.as_deref().unwrap_or(""),
                    p.due_at.as_deref(),
                )?;
                serde_json::to_string(&task)?
            }
            "list" => serde_json::to_string(&self.store.list_open_tasks()?)?,
            "get" => {
                let Some(id) = p.id else {
                    return Ok(json!({"error": "id is required for get"}).to_string());
                };
                match self.store.get_task(id)? {
                    Some(task) => serde_json::to_string(&task)?,
                    None => json!({"error": format!("no task with id {id}")}).to_string(),
                }
            }
            "update" => {
                let Some(id) = p.id else {
                    return Ok(json!({"error": "id is required for update"}).to_string());
                };
                if p.title.is_none()
                    && p.details.is_none()
                    && p.status.is_none()
                    && p.due_at.is_none()
                {
                    return Ok(json!({"error": "nothing to update"}).to_string());
                }
                let status = match p.status.as_deref() {
                    Some(s) => match TaskStatus::parse(s) {
                        Some(status) => Some(status),
                        None => {
                            return Ok(json!({"error": format!("unknown status: {s}")}).to_string())
                        }
                    },
                    None => None,
                };
                match self.store.update_task(
                    id,
                    p.title.as_deref(),
                    p.details.as_deref(),
                    status,
                    p.due_at.as_deref(),
                )? {
                    Some(task) => serde_json::to_string(&task)?,
                    None => json!({"error": format!("no task with id {id}")}).to_string(),
                }
            }
            "complete" => {
                let Some(id) = p.id else {
                    return Ok(json!({"error": "id is required for complete"}).to_string());
                };
                match self
                    .store
                    .update_task(id, None, None, Some(TaskStatus::Done), None)?
                {
                    Some(task) => serde_json::to_string(&task)?,
                    None => json!({"error": format!("no task with id {id}")}).to_string(),
                }
            }
            "delete" => {
                let Some(id) = p.id else {
                    return Ok(json!({"error": "id is required for delete"}).to_string());
                };
                let deleted = self.store.delete_task(id)?;
                json!({"deleted": deleted}).to_string()
            }
            other => json!({"error": format!("unknown action: {other}")}).to_string(),
        };

        Ok(result)
    }
}

// ── restart ──

/// Reload capabilities in place, or request a full process restart
pub struct RestartTool {
    registry: Arc<CapabilityRegistry>,
    restart: Arc<RestartSignal>,
}

#[derive(Deserialize)]
struct RestartParams {
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_mode() -> String {
    "reload".to_string()
}

#[async_trait]
impl Tool for RestartTool {
    fn name(&self) -> &str {
        "restart"
    }

    fn description(&self) -> &str {
        "Reload capabilities from disk (mode='reload') or restart the entire \
         process (mode='full', exits with code 42)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["reload", "full"],
                    "description": "'reload' to hot-reload capabilities, 'full' to restart"
                }
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let params: RestartParams = serde_json::from_value(args)?;
        match params.mode.as_str() {
            "reload" => {
                let report = self.registry.load_all().await?;
                let failures: serde_json::Map<String, serde_json::Value> = report
                    .failures
                    .iter()
                    .map(|(name, err)| (name.clone(), serde_json::Value::from(err.clone())))
                    .collect();
                Ok(json!({
                    "status": "reloaded",
                    "loaded": report.loaded,
                    "failures": failures,
                })
                .to_string())
            }
            "full" => {
                self.restart.request();
                Ok(json!({"status": "restarting", "exit_code": RESTART_EXIT_CODE}).to_string())
            }
            other => Ok(json!({"error": format!("unknown mode: {other}")}).to_string()),
        }
    }
}
