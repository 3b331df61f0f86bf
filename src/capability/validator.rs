//! Capability Validator
//!
//! Gates every new or updated capability through three ordered stages
//! before it can touch the durable store or the registry:
//!
//! 1. **Syntax** - parse the source in isolation. Nothing is written.
//! 2. **Binding** - materialize the script file and execute its top level.
//!    On failure the file is removed again.
//! 3. **Shape** - the unit must define exactly one function, named exactly
//!    like the capability, taking exactly one argument.
//!
//! Only after all three stages pass is the record upserted and the live
//! binding refreshed. Every rejection is a value the calling agent turn can
//! inspect and retry on; nothing here is fatal.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::capability::registry::CapabilityRegistry;
use crate::engine::{BindError, ScriptEngine};
use crate::store::Store;

/// Structured rejection, serialized back to the model as the tool result
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    /// Name is not a usable identifier (file stem, function name, tool name)
    InvalidName { message: String },
    /// Name collides with a built-in tool; built-ins are reserved words
    ReservedName { message: String },
    /// Parameter schema must be a JSON object
    InvalidSchema { message: String },
    /// Stage 1: the source does not parse
    SyntaxError {
        line: usize,
        column: usize,
        message: String,
    },
    /// Stage 2: the source parses but fails to load/execute
    ImportError { message: String },
    /// Stage 3: wrong function shape
    MissingFunction { message: String },
}

/// Result of a registration attempt
#[derive(Debug)]
pub enum ValidationOutcome {
    Registered { name: String, file: String },
    Rejected(ValidationError),
}

impl ValidationOutcome {
    /// Shape for the model, mirroring the tool's JSON contract
    pub fn to_json(&self) -> String {
        match self {
            Self::Registered { name, file } => serde_json::json!({
                "status": "ok",
                "capability": name,
                "file": file,
            })
            .to_string(),
            Self::Rejected(err) => {
                serde_json::to_string(err).unwrap_or_else(|_| format!("{{\"error\":\"{err:?}\"}}"))
            }
        }
    }
}

/// Validate-then-register pipeline for capability source
pub struct Validator {
    store: Arc<Store>,
    engine: Arc<ScriptEngine>,
    registry: Arc<CapabilityRegistry>,
    capabilities_dir: PathBuf,
    reserved_names: Vec<String>,
}

impl Validator {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<ScriptEngine>,
        registry: Arc<CapabilityRegistry>,
        capabilities_dir: PathBuf,
        reserved_names: Vec<String>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            capabilities_dir,
            reserved_names,
        }
    }

    /// Run the full pipeline for one capability. Holds the per-name lock
    /// across validate -> upsert -> reload so concurrent attempts on the
    /// same name cannot interleave their stages.
    pub async fn register(
        &self,
        name: &str,
        description: &str,
        code: &str,
        parameter_schema: &serde_json::Value,
    ) -> anyhow::Result<ValidationOutcome> {
        let lock = self.registry.name_lock(name).await;
        let _guard = lock.lock().await;

        // Preconditions: nothing has been written yet, so plain rejects
        if let Err(err) = self.check_name(name) {
            return Ok(ValidationOutcome::Rejected(err));
        }
        if !parameter_schema.is_object() {
            return Ok(ValidationOutcome::Rejected(ValidationError::InvalidSchema {
                message: "parameters_schema must be a JSON object".to_string(),
            }));
        }

        // Stage 1: syntax, in isolation
        let ast = match self.engine.check_syntax(code) {
            Ok(ast) => ast,
            Err(BindError::Syntax {
                line,
                column,
                message,
            }) => {
                return Ok(ValidationOutcome::Rejected(ValidationError::SyntaxError {
                    line,
                    column,
                    message,
                }));
            }
            Err(other) => {
                return Ok(ValidationOutcome::Rejected(ValidationError::ImportError {
                    message: other.to_string(),
                }));
            }
        };

        // Stage 2: materialize and load
        std::fs::create_dir_all(&self.capabilities_dir)?;
        let path = self.capabilities_dir.join(format!("{name}.rhai"));
        std::fs::write(&path, code)?;

        if let Err(e) = self.engine.run_top_level(&ast) {
            self.discard_artifact(name, &path).await;
            return Ok(ValidationOutcome::Rejected(ValidationError::ImportError {
                message: e.to_string(),
            }));
        }

        // Stage 3: exactly one function, right name, one argument
        let fns = self.engine.functions(&ast);
        let shape_ok = fns.len() == 1 && fns[0].name == name && fns[0].arity == 1;
        if !shape_ok {
            self.discard_artifact(name, &path).await;
            return Ok(ValidationOutcome::Rejected(ValidationError::MissingFunction {
                message: format!(
                    "script must define exactly one function `fn {name}(params)` returning a string"
                ),
            }));
        }

        // All stages passed: durable record first, then the live binding
        let file = path.to_string_lossy().to_string();
        self.store
            .upsert_capability(name, description, &file, parameter_schema)?;
        self.registry.reload_one(name).await?;

        info!("Registered capability: {}", name);
        Ok(ValidationOutcome::Registered {
            name: name.to_string(),
            file,
        })
    }

    fn check_name(&self, name: &str) -> Result<(), ValidationError> {
        let valid = !name.is_empty()
            && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(ValidationError::InvalidName {
                message: format!(
                    "capability name must be snake_case ([a-z][a-z0-9_]*), got '{name}'"
                ),
            });
        }
        if self.reserved_names.iter().any(|r| r == name) {
            return Err(ValidationError::ReservedName {
                message: format!("'{name}' is a built-in tool name and cannot be overridden"),
            });
        }
        Ok(())
    }

    /// Remove a half-materialized script. If an older version of this
    /// capability was live, its source file is gone now, so drop the stale
    /// binding too - the durable record stays and the divergence shows up
    /// in the next load report.
    async fn discard_artifact(&self, name: &str, path: &std::path::Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove rejected script {}: {}", path.display(), e);
        }
        if self.registry.get(name).await.is_some() {
            self.registry.unbind(name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const DOUBLE_SRC: &str =
        "fn double(params) {\n    (params.n * 2).to_string()\n}\n";

    struct Fixture {
        store: Arc<Store>,
        registry: Arc<CapabilityRegistry>,
        validator: Validator,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Arc::new(ScriptEngine::new());
        let registry = Arc::new(CapabilityRegistry::new(
            Arc::clone(&store),
            Arc::clone(&engine),
        ));
        let dir = TempDir::new().unwrap();
        let validator = Validator::new(
            Arc::clone(&store),
            engine,
            Arc::clone(&registry),
            dir.path().to_path_buf(),
            vec!["execute_sql".to_string(), "restart".to_string()],
        );
        Fixture {
            store,
            registry,
            validator,
            dir,
        }
    }

    fn schema() -> serde_json::Value {
        json!({"type": "object", "properties": {"n": {"type": "integer"}}})
    }

    #[tokio::test]
    async fn test_valid_source_registers() {
        let f = fixture();
        let outcome = f
            .validator
            .register("double", "Doubles an integer", DOUBLE_SRC, &schema())
            .await
            .unwrap();

        assert!(matches!(outcome, ValidationOutcome::Registered { .. }));
        assert!(f.dir.path().join("double.rhai").exists());
        assert!(f.store.get_capability("double").unwrap().is_some());
        assert!(f.registry.get("double").await.is_some());
    }

    #[tokio::test]
    async fn test_syntax_reject_writes_nothing() {
        let f = fixture();
        let outcome = f
            .validator
            .register("broken", "Broken", "fn broken( {", &schema())
            .await
            .unwrap();

        match outcome {
            ValidationOutcome::Rejected(ValidationError::SyntaxError { line, .. }) => {
                assert!(line >= 1);
            }
            other => panic!("expected syntax rejection, got {other:?}"),
        }
        assert!(!f.dir.path().join("broken.rhai").exists());
        assert!(f.store.get_capability("broken").unwrap().is_none());
        assert!(f.registry.get("broken").await.is_none());
    }

    #[tokio::test]
    async fn test_binding_reject_removes_artifact() {
        let f = fixture();
        let source = "undefined_call();\nfn flaky(params) { \"x\" }";
        let outcome = f
            .validator
            .register("flaky", "Flaky", source, &schema())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected(ValidationError::ImportError { .. })
        ));
        assert!(!f.dir.path().join("flaky.rhai").exists());
        assert!(f.store.get_capability("flaky").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shape_reject_removes_artifact() {
        let f = fixture();
        let source = "fn other_name(params) { \"x\" }";
        let outcome = f
            .validator
            .register("shaped", "Mis-shaped", source, &schema())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected(ValidationError::MissingFunction { .. })
        ));
        assert!(!f.dir.path().join("shaped.rhai").exists());
        assert!(f.store.get_capability("shaped").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_functions_rejected() {
        let f = fixture();
        let source = "fn pair(params) { \"x\" }\nfn helper(x) { x }";
        let outcome = f
            .validator
            .register("pair", "Two fns", source, &schema())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected(ValidationError::MissingFunction { .. })
        ));
    }

    #[tokio::test]
    async fn test_reserved_name_rejected() {
        let f = fixture();
        let outcome = f
            .validator
            .register("restart", "Shadow restart", DOUBLE_SRC, &schema())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected(ValidationError::ReservedName { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected() {
        let f = fixture();
        for bad in ["", "Has-Dash", "9starts_digit", "Upper"] {
            let outcome = f
                .validator
                .register(bad, "Bad name", DOUBLE_SRC, &schema())
                .await
                .unwrap();
            assert!(
                matches!(
                    outcome,
                    ValidationOutcome::Rejected(ValidationError::InvalidName { .. })
                ),
                "name '{bad}' should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_update_replaces_behavior() {
        let f = fixture();
        f.validator
            .register("calc", "v1", "fn calc(params) { (params.n * 2).to_string() }", &schema())
            .await
            .unwrap();

        let outcome = f
            .validator
            .register("calc", "v2", "fn calc(params) { (params.n * 3).to_string() }", &schema())
            .await
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Registered { .. }));

        let cap = f.registry.get("calc").await.unwrap();
        let engine = ScriptEngine::new();
        assert_eq!(engine.invoke(&cap.handle, &json!({"n": 4})).unwrap(), "12");
        assert_eq!(
            f.store.get_capability("calc").unwrap().unwrap().description,
            "v2"
        );
    }

    #[tokio::test]
    async fn test_failed_update_unbinds_prior_load() {
        let f = fixture();
        f.validator
            .register("calc", "v1", "fn calc(params) { (params.n * 2).to_string() }", &schema())
            .await
            .unwrap();
        assert!(f.registry.get("calc").await.is_some());

        // Update whose binding stage fails: artifact is gone, record stays,
        // the stale live binding is dropped.
        let outcome = f
            .validator
            .register("calc", "v2", "boom();\nfn calc(params) { \"x\" }", &schema())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected(ValidationError::ImportError { .. })
        ));
        assert!(!f.dir.path().join("calc.rhai").exists());
        assert!(f.store.get_capability("calc").unwrap().is_some());
        assert!(f.registry.get("calc").await.is_none());
    }

    #[test]
    fn test_rejection_json_shape() {
        let outcome = ValidationOutcome::Rejected(ValidationError::SyntaxError {
            line: 3,
            column: 7,
            message: "unexpected token".to_string(),
        });
        let parsed: serde_json::Value = serde_json::from_str(&outcome.to_json()).unwrap();
        assert_eq!(parsed["error"], "syntax_error");
        assert_eq!(parsed["line"], 3);
        assert_eq!(parsed["column"], 7);
    }
}
