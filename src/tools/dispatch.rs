//! Dispatcher
//!
//! Executes one requested tool call against the current catalog. The
//! contract is failure isolation and result-shape normalization: whatever
//! goes wrong - unknown name, unparseable arguments, a tool error - comes
//! back as a textual result the model can reason about. Nothing here ever
//! terminates the turn or the process.

use serde_json::json;
use tracing::{debug, warn};

use crate::tools::ToolCatalog;

/// Run one tool call. `raw_arguments` is the JSON-encoded argument string
/// exactly as the model sent it.
pub async fn dispatch(catalog: &ToolCatalog, name: &str, raw_arguments: &str) -> String {
    let Some(tool) = catalog.get(name) else {
        warn!("Unknown tool requested: {}", name);
        return json!({"error": format!("unknown tool: {name}")}).to_string();
    };

    let args: serde_json::Value = match serde_json::from_str(raw_arguments) {
        Ok(serde_json::Value::Null) => json!({}),
        Ok(value) => value,
        Err(e) => {
            return json!({"error": format!("invalid tool arguments: {e}")}).to_string();
        }
    };

    debug!("Dispatching tool call: {}", name);
    match tool.execute(args).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Tool '{}' failed: {:#}", name, e);
            json!({"error": e.to_string()}).to_string()
        }
    }
}
