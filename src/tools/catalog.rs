//! Tool Catalog
//!
//! One flat namespace over built-ins and live capabilities. The catalog is
//! a pure function of the registry's current state and is rebuilt on every
//! agent-loop iteration, so a capability registered mid-turn is callable on
//! the next iteration.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{CapabilityRegistry, LoadedCapability};
use crate::engine::ScriptEngine;
use crate::llm::ToolSchema;
use crate::tools::Tool;

/// A loaded capability projected as an invocable tool
struct CapabilityTool {
    capability: Arc<LoadedCapability>,
    engine: Arc<ScriptEngine>,
}

#[async_trait]
impl Tool for CapabilityTool {
    fn name(&self) -> &str {
        self.capability.handle.name()
    }

    fn description(&self) -> &str {
        &self.capability.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.capability.schema.clone()
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        Ok(self.engine.invoke(&self.capability.handle, &args)?)
    }
}

/// Snapshot of every callable tool for one loop iteration
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Built-ins first, then capabilities sorted by name
    order: Vec<String>,
}

impl ToolCatalog {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas in catalog order, ready for the model call
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                ToolSchema::function(tool.name(), tool.description(), tool.parameters_schema())
            })
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builds catalogs from the fixed built-in set plus the live registry
pub struct CatalogBuilder {
    builtins: Vec<Arc<dyn Tool>>,
    registry: Arc<CapabilityRegistry>,
    engine: Arc<ScriptEngine>,
}

impl CatalogBuilder {
    pub fn new(
        builtins: Vec<Arc<dyn Tool>>,
        registry: Arc<CapabilityRegistry>,
        engine: Arc<ScriptEngine>,
    ) -> Self {
        Self {
            builtins,
            registry,
            engine,
        }
    }

    /// Union built-ins with the current registry snapshot
    pub async fn build(&self) -> ToolCatalog {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        let mut order = Vec::new();

        for tool in &self.builtins {
            order.push(tool.name().to_string());
            tools.insert(tool.name().to_string(), Arc::clone(tool));
        }

        for (name, capability) in self.registry.snapshot().await {
            // Built-ins are reserved; the validator enforces this, so a
            // collision here would be a registry bug worth surfacing
            debug_assert!(!tools.contains_key(&name), "capability shadows built-in: {name}");
            order.push(name.clone());
            tools.insert(
                name,
                Arc::new(CapabilityTool {
                    capability,
                    engine: Arc::clone(&self.engine),
                }),
            );
        }

        ToolCatalog { tools, order }
    }

    /// Capability names currently loaded, with descriptions, for the
    /// system prompt
    pub async fn capability_lines(&self) -> Vec<(String, String)> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(|(name, cap)| (name, cap.description.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Validator;
    use crate::restart::RestartSignal;
    use crate::store::Store;
    use crate::tools::builtin::{builtin_tools, BUILTIN_TOOL_NAMES};
    use serde_json::json;
    use tempfile::TempDir;

    async fn builder_with_capability() -> (CatalogBuilder, TempDir) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Arc::new(ScriptEngine::new());
        let registry = Arc::new(CapabilityRegistry::new(
            Arc::clone(&store),
            Arc::clone(&engine),
        ));
        let dir = TempDir::new().unwrap();
        let validator = Arc::new(Validator::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&registry),
            dir.path().to_path_buf(),
            BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
        ));

        validator
            .register(
                "double",
                "Doubles an integer",
                "fn double(params) { (params.n * 2).to_string() }",
                &json!({"type": "object", "properties": {"n": {"type": "integer"}}}),
            )
            .await
            .unwrap();

        let builtins = builtin_tools(
            store,
            validator,
            Arc::clone(&registry),
            RestartSignal::new(),
        );
        (CatalogBuilder::new(builtins, registry, engine), dir)
    }

    #[tokio::test]
    async fn test_catalog_unions_builtins_and_capabilities() {
        let (builder, _dir) = builder_with_capability().await;
        let catalog = builder.build().await;

        assert_eq!(catalog.len(), BUILTIN_TOOL_NAMES.len() + 1);
        for name in BUILTIN_TOOL_NAMES {
            assert!(catalog.contains(name), "missing built-in {name}");
        }
        assert!(catalog.contains("double"));
    }

    #[tokio::test]
    async fn test_exactly_one_entry_per_capability() {
        let (builder, _dir) = builder_with_capability().await;
        let catalog = builder.build().await;
        let count = catalog.names().iter().filter(|n| *n == "double").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_capability_tool_dispatches_to_script() {
        let (builder, _dir) = builder_with_capability().await;
        let catalog = builder.build().await;

        let tool = catalog.get("double").unwrap();
        let result = tool.execute(json!({"n": 21})).await.unwrap();
        assert_eq!(result, "42");
    }

    #[tokio::test]
    async fn test_schemas_expose_descriptions() {
        let (builder, _dir) = builder_with_capability().await;
        let catalog = builder.build().await;

        let schemas = catalog.schemas();
        assert_eq!(schemas.len(), catalog.len());
        let double = schemas
            .iter()
            .find(|s| s.function.name == "double")
            .unwrap();
        assert_eq!(double.function.description, "Doubles an integer");
    }
}
