//! Turn State Machine
//!
//! Gathers context, calls the model, dispatches requested tool calls, and
//! repeats under the iteration bound. Every message in the working sequence
//! is appended to the conversation log exactly once, in production order,
//! whether the turn ends normally, at the bound, or on a model error.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::llm::{ChatMessage, ModelClient, ModelReply, ToolCall};
use crate::store::Store;
use crate::tools::{dispatch, CatalogBuilder};

/// How far ahead GATHER looks for task context
const TASK_CONTEXT_HORIZON: Duration = Duration::from_secs(3600);
/// Cap on tasks injected into the system prompt
const TASK_CONTEXT_LIMIT: usize = 10;

const SYSTEM_PROMPT_TEMPLATE: &str = "\
You are a personal assistant that can build its own capabilities.

You have 4 bootstrap tools that are always available:
execute_sql, write_capability, manage_tasks, restart.

{capabilities_section}

If a user asks you to do something you can't do yet, you can build a new
capability using write_capability. Write the Rhai script, define the
parameter schema, and register it. It will be immediately available.

When building capabilities, you MUST follow these rules:
- The script MUST define exactly one function: `fn name(params) { ... }`
- The function MUST return a string (build a JSON string for structured data)
- The function name MUST match the capability name exactly
- Scripts run in an embedded interpreter: no filesystem, network, or shell
- Use the execute_sql tool if you need to create new tables or query data

{tasks_section}";

/// Typed progress events, emitted in production order
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Final assistant text - the turn is done
    Assistant { content: String },
    /// A tool call the model requested
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// The dispatched result for the preceding call
    ToolResult { name: String, content: String },
    /// Terminal turn-level failure (model or store)
    Error { content: String },
    /// The iteration bound was reached without a final reply. Not an error.
    IterationLimit { iterations: usize },
}

/// The agent loop: shared across the chat transport and the heartbeat.
/// Cloning is cheap - all state lives behind `Arc`s.
#[derive(Clone)]
pub struct Agent {
    store: Arc<Store>,
    model: Arc<dyn ModelClient>,
    catalogs: Arc<CatalogBuilder>,
    history_limit: usize,
    max_iterations: usize,
}

impl Agent {
    pub fn new(
        store: Arc<Store>,
        model: Arc<dyn ModelClient>,
        catalogs: Arc<CatalogBuilder>,
        history_limit: usize,
        max_iterations: usize,
    ) -> Self {
        Self {
            store,
            model,
            catalogs,
            history_limit,
            max_iterations,
        }
    }

    /// Process one input through the turn state machine, streaming events
    /// as they occur. The stream is finite and not restartable.
    pub fn handle_message(&self, input: String) -> ReceiverStream<AgentEvent> {
        let (tx, rx) = mpsc::channel(32);
        let agent = self.clone();
        tokio::spawn(async move {
            agent.run_turn(input, tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Run a turn to completion and collect its events. Used by the
    /// heartbeat and by tests.
    pub async fn collect_turn(&self, input: String) -> Vec<AgentEvent> {
        let mut stream = self.handle_message(input);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    async fn run_turn(&self, input: String, tx: mpsc::Sender<AgentEvent>) {
        // GATHER before the input is persisted, so the history window never
        // contains the message this turn is about to append itself
        let (history, system_prompt) = match self.gather().await {
            Ok(context) => context,
            Err(e) => {
                error!("Context gathering failed: {:#}", e);
                let _ = tx
                    .send(AgentEvent::Error {
                        content: format!("store error: {e}"),
                    })
                    .await;
                return;
            }
        };

        if let Err(e) = self.store.append_message("user", &input, None, None) {
            error!("Failed to persist user message: {:#}", e);
            let _ = tx
                .send(AgentEvent::Error {
                    content: format!("store error: {e}"),
                })
                .await;
            return;
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&system_prompt));
        messages.extend(history);
        messages.push(ChatMessage::user(&input));

        for _iteration in 0..self.max_iterations {
            // The catalog is a pure function of registry state and must be
            // rebuilt every iteration - a prior dispatch round may have
            // registered or replaced capabilities
            let catalog = self.catalogs.build().await;
            let schemas = catalog.schemas();

            // MODEL_CALL
            let reply = match self.model.chat(&messages, &schemas).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("Model call failed: {:#}", e);
                    let _ = tx
                        .send(AgentEvent::Error {
                            content: format!("model error: {e}"),
                        })
                        .await;
                    return;
                }
            };

            let (content, calls) = match reply {
                ModelReply::Final(text) => {
                    if let Err(e) = self.store.append_message("assistant", &text, None, None) {
                        warn!("Failed to persist assistant reply: {:#}", e);
                    }
                    let _ = tx.send(AgentEvent::Assistant { content: text }).await;
                    return;
                }
                ModelReply::ToolCalls { content, calls } => (content, calls),
            };

            // Record the request before executing anything from it
            messages.push(ChatMessage::assistant_tool_calls(
                content.clone(),
                calls.clone(),
            ));
            let calls_json = serde_json::to_value(&calls).unwrap_or_default();
            if let Err(e) = self.store.append_message(
                "assistant",
                content.as_deref().unwrap_or(""),
                None,
                Some(&calls_json),
            ) {
                warn!("Failed to persist tool-call request: {:#}", e);
            }

            // DISPATCH: sequential, in the order received, each result fed
            // back before the next model call
            for call in calls {
                self.dispatch_one(&catalog, &call, &mut messages, &tx).await;
            }
        }

        info!("Turn hit the iteration bound ({})", self.max_iterations);
        let _ = tx
            .send(AgentEvent::IterationLimit {
                iterations: self.max_iterations,
            })
            .await;
    }

    async fn dispatch_one(
        &self,
        catalog: &crate::tools::ToolCatalog,
        call: &ToolCall,
        messages: &mut Vec<ChatMessage>,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let name = &call.function.name;
        let arguments: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
        let _ = tx
            .send(AgentEvent::ToolCall {
                name: name.clone(),
                arguments,
            })
            .await;

        let result = dispatch(catalog, name, &call.function.arguments).await;

        let _ = tx
            .send(AgentEvent::ToolResult {
                name: name.clone(),
                content: result.clone(),
            })
            .await;

        messages.push(ChatMessage::tool_result(&call.id, &result));
        if let Err(e) = self
            .store
            .append_message("tool", &result, Some(&call.id), None)
        {
            warn!("Failed to persist tool result: {:#}", e);
        }
    }

    /// Load the history window and assemble the system prompt
    async fn gather(&self) -> anyhow::Result<(Vec<ChatMessage>, String)> {
        let mut stored = self.store.recent_messages(self.history_limit)?;
        stored.reverse(); // chronological

        let mut history: Vec<ChatMessage> = stored
            .into_iter()
            .map(|msg| {
                let tool_calls: Option<Vec<ToolCall>> = msg
                    .tool_calls
                    .and_then(|v| serde_json::from_value(v).ok());
                ChatMessage {
                    role: msg.role,
                    // Assistant messages carrying only tool calls omit text
                    content: if msg.content.is_empty() && tool_calls.is_some() {
                        None
                    } else {
                        Some(msg.content)
                    },
                    tool_call_id: msg.tool_call_id,
                    tool_calls,
                }
            })
            .collect();

        // Trim the window's leading edge to a clean boundary: every tool
        // result must follow its requesting message, and the LIMIT above may
        // have truncated mid-exchange
        while history
            .first()
            .is_some_and(|m| m.role == "tool" || m.tool_calls.is_some())
        {
            history.remove(0);
        }

        let capabilities = self.catalogs.capability_lines().await;
        let capabilities_section = if capabilities.is_empty() {
            "You have no self-built capabilities yet.".to_string()
        } else {
            let lines: Vec<String> = capabilities
                .iter()
                .map(|(name, description)| format!("- {name}: {description}"))
                .collect();
            format!(
                "You have {} self-built capabilities:\n{}",
                capabilities.len(),
                lines.join("\n")
            )
        };

        let due = self
            .store
            .context_tasks(TASK_CONTEXT_HORIZON, TASK_CONTEXT_LIMIT)?;
        let tasks_section = if due.is_empty() {
            String::new()
        } else {
            format!(
                "Current tasks due soon:\n{}",
                serde_json::to_string(&due).unwrap_or_else(|_| "[]".to_string())
            )
        };

        let system_prompt = SYSTEM_PROMPT_TEMPLATE
            .replace("{capabilities_section}", &capabilities_section)
            .replace("{tasks_section}", &tasks_section);

        Ok((history, system_prompt))
    }
}
