//! toolforge
//!
//! A conversational agent that extends itself at runtime: it authors new
//! executable capabilities, validates and registers them, and makes them
//! callable in the same session without a process restart.
//!
//! # Architecture
//!
//! ```text
//! user / heartbeat ──► Agent Loop ──► Tool Catalog ──► model call
//!                          │               │
//!                          │               ├── built-ins (fixed)
//!                          ▼               └── Capability Registry (live)
//!                      Dispatcher                    ▲
//!                          │                         │ reload_one
//!                          └── write_capability ──► Validator
//!                                                    │ syntax → binding → shape
//!                                                    └── SQLite store + .rhai files
//! ```
//!
//! Capabilities are Rhai scripts gated by a three-stage validation pipeline
//! before they touch the durable store or the live registry. Every tool
//! failure is folded back into the conversation as data, never a crash.

pub mod agent;
pub mod capability;
pub mod config;
pub mod engine;
pub mod llm;
pub mod restart;
pub mod server;
pub mod store;
pub mod tools;

pub use agent::{Agent, AgentEvent, Heartbeat};
pub use capability::{CapabilityRegistry, ValidationError, ValidationOutcome, Validator};
pub use config::Config;
pub use engine::ScriptEngine;
pub use llm::{ChatMessage, ModelClient, ModelReply, OpenAiCompatClient, ToolSchema};
pub use restart::{RestartSignal, RESTART_EXIT_CODE};
pub use store::{CapabilityRecord, Store, TaskRecord, TaskStatus};
pub use tools::{builtin_tools, CatalogBuilder, Tool, ToolCatalog, BUILTIN_TOOL_NAMES};
