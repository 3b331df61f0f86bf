//! Tools
//!
//! Everything the model can call: the fixed built-in set, the per-iteration
//! catalog that unions built-ins with live capabilities, and the dispatcher
//! that executes one requested call while isolating its failures.

pub mod builtin;
pub mod catalog;
pub mod dispatch;

use anyhow::Result;
use async_trait::async_trait;

pub use builtin::{builtin_tools, BUILTIN_TOOL_NAMES};
pub use catalog::{CatalogBuilder, ToolCatalog};
pub use dispatch::dispatch;

/// An invocable tool: built-in or loaded capability
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, the callable symbol in the catalog namespace
    fn name(&self) -> &str;

    /// Purpose line shown to the model
    fn description(&self) -> &str;

    /// JSON Schema for the argument object
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. Each tool validates its own argument shape; errors
    /// are returned, never panicked, so the dispatcher can fold them into
    /// the conversation.
    async fn execute(&self, args: serde_json::Value) -> Result<String>;
}
