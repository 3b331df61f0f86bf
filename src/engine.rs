//! Script Engine
//!
//! The runtime-loading mechanism behind capabilities: Rhai source compiles
//! to an AST, the AST is the invocable handle. Binding a unit means
//! compiling it, running its top-level statements once, and resolving the
//! named entry function. Invocation calls that function with a single
//! JSON-mapped argument and requires a text result.
//!
//! Scripts run with bounded operations and call depth so a runaway
//! capability cannot stall the process.

use rhai::{Dynamic, Engine, Scope, AST};
use std::sync::Arc;
use thiserror::Error;

/// Hard ceiling on interpreter operations per invocation
const MAX_OPERATIONS: u64 = 1_000_000;
/// Maximum nested call depth inside a script
const MAX_CALL_LEVELS: usize = 64;

/// Failure to turn source into an invocable handle
#[derive(Debug, Error)]
pub enum BindError {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("evaluation of top-level code failed: {message}")]
    Eval { message: String },

    #[error("script does not define a function named '{name}' taking one argument")]
    MissingFunction { name: String },
}

/// Failure during a capability call
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("invalid arguments: {0}")]
    Arguments(String),

    #[error("capability call failed: {0}")]
    Eval(String),

    #[error("capability returned {type_name}, expected a string")]
    NotText { type_name: String },
}

/// A script function visible in a compiled unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnInfo {
    pub name: String,
    pub arity: usize,
}

/// An invocable handle: the compiled unit plus its entry function name
#[derive(Clone)]
pub struct Handle {
    name: String,
    ast: Arc<AST>,
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("name", &self.name).finish()
    }
}

/// Shared Rhai engine configured for capability scripts
pub struct ScriptEngine {
    engine: Engine,
}

impl ScriptEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_call_levels(MAX_CALL_LEVELS);
        Self { engine }
    }

    /// Parse source without executing anything
    pub fn check_syntax(&self, source: &str) -> Result<AST, BindError> {
        self.engine.compile(source).map_err(|err| {
            let pos = err.1;
            BindError::Syntax {
                line: pos.line().unwrap_or(0),
                column: pos.position().unwrap_or(0),
                message: err.0.to_string(),
            }
        })
    }

    /// List the script functions a compiled unit defines
    pub fn functions(&self, ast: &AST) -> Vec<FnInfo> {
        ast.iter_functions()
            .map(|f| FnInfo {
                name: f.name.to_string(),
                arity: f.params.len(),
            })
            .collect()
    }

    /// Execute a compiled unit's top-level statements once
    pub fn run_top_level(&self, ast: &AST) -> Result<(), BindError> {
        self.engine.run_ast(ast).map_err(|e| BindError::Eval {
            message: e.to_string(),
        })
    }

    /// Bind source into an invocable handle: compile, run the top level
    /// once, and resolve the entry function `name` with arity 1.
    pub fn bind(&self, name: &str, source: &str) -> Result<Handle, BindError> {
        let ast = self.check_syntax(source)?;
        self.run_top_level(&ast)?;

        let entry = self
            .functions(&ast)
            .into_iter()
            .find(|f| f.name == name && f.arity == 1);
        if entry.is_none() {
            return Err(BindError::MissingFunction {
                name: name.to_string(),
            });
        }

        Ok(Handle {
            name: name.to_string(),
            ast: Arc::new(ast),
        })
    }

    /// Call a handle's entry function with one JSON argument. The script
    /// must return a string; anything else is an invocation error.
    pub fn invoke(&self, handle: &Handle, args: &serde_json::Value) -> Result<String, InvokeError> {
        let arg: Dynamic = rhai::serde::to_dynamic(args.clone())
            .map_err(|e| InvokeError::Arguments(e.to_string()))?;

        let mut scope = Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &handle.ast, &handle.name, (arg,))
            .map_err(|e| InvokeError::Eval(e.to_string()))?;

        if !result.is_string() {
            return Err(InvokeError::NotText {
                type_name: result.type_name().to_string(),
            });
        }
        Ok(result.into_string().unwrap_or_default().to_string())
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOUBLE_SRC: &str = r#"
fn double(params) {
    let n = params.n;
    (n * 2).to_string()
}
"#;

    #[test]
    fn test_bind_and_invoke() {
        let engine = ScriptEngine::new();
        let handle = engine.bind("double", DOUBLE_SRC).unwrap();
        let result = engine.invoke(&handle, &json!({"n": 21})).unwrap();
        assert_eq!(result, "42");
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let engine = ScriptEngine::new();
        let err = engine.check_syntax("fn broken( {").unwrap_err();
        match err {
            BindError::Syntax { line, .. } => assert!(line >= 1),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_bind_rejects_missing_entry_function() {
        let engine = ScriptEngine::new();
        let err = engine
            .bind("double", "fn other(params) { \"x\" }")
            .unwrap_err();
        assert!(matches!(err, BindError::MissingFunction { .. }));
    }

    #[test]
    fn test_bind_rejects_wrong_arity() {
        let engine = ScriptEngine::new();
        let err = engine
            .bind("double", "fn double(a, b) { \"x\" }")
            .unwrap_err();
        assert!(matches!(err, BindError::MissingFunction { .. }));
    }

    #[test]
    fn test_top_level_failure_is_eval_error() {
        let engine = ScriptEngine::new();
        let source = "undefined_call();\nfn double(params) { \"x\" }";
        let err = engine.bind("double", source).unwrap_err();
        assert!(matches!(err, BindError::Eval { .. }));
    }

    #[test]
    fn test_non_string_return_rejected() {
        let engine = ScriptEngine::new();
        let handle = engine
            .bind("answer", "fn answer(params) { 42 }")
            .unwrap();
        let err = engine.invoke(&handle, &json!({})).unwrap_err();
        assert!(matches!(err, InvokeError::NotText { .. }));
    }

    #[test]
    fn test_script_runtime_error_isolated() {
        let engine = ScriptEngine::new();
        let handle = engine
            .bind("boom", "fn boom(params) { params.missing.deeper }")
            .unwrap();
        let err = engine.invoke(&handle, &json!({})).unwrap_err();
        assert!(matches!(err, InvokeError::Eval(_)));
    }

    #[test]
    fn test_functions_enumeration() {
        let engine = ScriptEngine::new();
        let ast = engine
            .check_syntax("fn a(x) { x }\nfn b(x, y) { x }")
            .unwrap();
        let mut fns = engine.functions(&ast);
        fns.sort_by(|l, r| l.name.cmp(&r.name));
        assert_eq!(fns.len(), 2);
        assert_eq!(fns[0], FnInfo { name: "a".into(), arity: 1 });
        assert_eq!(fns[1], FnInfo { name: "b".into(), arity: 2 });
    }
}
