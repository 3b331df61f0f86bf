//! Capability Pipeline Integration Tests
//!
//! End-to-end coverage of the validate-then-register flow: each stage's
//! no-mutation guarantees, overwrite-update semantics, and registry reload
//! behavior.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use toolforge::capability::{CapabilityRegistry, ValidationError, ValidationOutcome, Validator};
use toolforge::engine::ScriptEngine;
use toolforge::store::Store;
use toolforge::BUILTIN_TOOL_NAMES;

const DOUBLE_CODE: &str = "fn double(params) {\n    (params.n * 2).to_string()\n}\n";

struct Stack {
    store: Arc<Store>,
    engine: Arc<ScriptEngine>,
    registry: Arc<CapabilityRegistry>,
    validator: Arc<Validator>,
    dir: TempDir,
}

fn stack() -> Stack {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let engine = Arc::new(ScriptEngine::new());
    let registry = Arc::new(CapabilityRegistry::new(
        Arc::clone(&store),
        Arc::clone(&engine),
    ));
    let dir = TempDir::new().expect("tempdir");
    let validator = Arc::new(Validator::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&registry),
        dir.path().to_path_buf(),
        BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
    ));
    Stack {
        store,
        engine,
        registry,
        validator,
        dir,
    }
}

fn schema() -> serde_json::Value {
    json!({"type": "object", "properties": {"n": {"type": "integer"}}})
}

fn artifact_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn syntax_failure_mutates_nothing() {
    let s = stack();
    let outcome = s
        .validator
        .register("bad", "Bad", "fn bad( {", &schema())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ValidationOutcome::Rejected(ValidationError::SyntaxError { .. })
    ));
    assert_eq!(artifact_count(&s.dir), 0);
    assert!(s.store.all_capabilities().unwrap().is_empty());
    assert_eq!(s.registry.count().await, 0);
}

#[tokio::test]
async fn binding_failure_removes_artifact_and_skips_store() {
    let s = stack();
    let outcome = s
        .validator
        .register(
            "flaky",
            "Flaky",
            "no_such_fn();\nfn flaky(params) { \"x\" }",
            &schema(),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ValidationOutcome::Rejected(ValidationError::ImportError { .. })
    ));
    assert_eq!(artifact_count(&s.dir), 0);
    assert!(s.store.all_capabilities().unwrap().is_empty());
}

#[tokio::test]
async fn shape_failure_removes_artifact_and_skips_store() {
    let s = stack();
    let outcome = s
        .validator
        .register("named", "Wrong fn name", "fn other(params) { \"x\" }", &schema())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ValidationOutcome::Rejected(ValidationError::MissingFunction { .. })
    ));
    assert_eq!(artifact_count(&s.dir), 0);
    assert!(s.store.all_capabilities().unwrap().is_empty());
}

#[tokio::test]
async fn valid_source_registers_exactly_once() {
    let s = stack();
    let outcome = s
        .validator
        .register("double", "Doubles an integer", DOUBLE_CODE, &schema())
        .await
        .unwrap();

    assert!(matches!(outcome, ValidationOutcome::Registered { .. }));
    assert_eq!(artifact_count(&s.dir), 1);

    let entries = s.registry.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "double");

    let cap = s.registry.get("double").await.unwrap();
    assert_eq!(
        s.engine.invoke(&cap.handle, &json!({"n": 21})).unwrap(),
        "42"
    );
}

#[tokio::test]
async fn reregistration_replaces_live_binding() {
    let s = stack();
    s.validator
        .register("calc", "v1", "fn calc(params) { (params.n + 1).to_string() }", &schema())
        .await
        .unwrap();
    s.validator
        .register("calc", "v2", "fn calc(params) { (params.n + 2).to_string() }", &schema())
        .await
        .unwrap();

    // Only the new behavior is observable, and only one record exists
    let cap = s.registry.get("calc").await.unwrap();
    assert_eq!(s.engine.invoke(&cap.handle, &json!({"n": 1})).unwrap(), "3");
    assert_eq!(s.store.all_capabilities().unwrap().len(), 1);
    assert_eq!(artifact_count(&s.dir), 1);
}

#[tokio::test]
async fn full_reload_twice_is_identical() {
    let s = stack();
    s.validator
        .register("double", "Doubles", DOUBLE_CODE, &schema())
        .await
        .unwrap();
    s.validator
        .register("shout", "Upper-cases", "fn shout(params) { params.text.to_upper() }", &schema())
        .await
        .unwrap();

    s.registry.load_all().await.unwrap();
    let first: Vec<String> = s.registry.snapshot().await.into_iter().map(|(n, _)| n).collect();

    s.registry.load_all().await.unwrap();
    let second: Vec<String> = s.registry.snapshot().await.into_iter().map(|(n, _)| n).collect();

    assert_eq!(first, second);
    assert_eq!(first, vec!["double".to_string(), "shout".to_string()]);
}

#[tokio::test]
async fn load_all_reports_missing_source_file() {
    let s = stack();
    s.validator
        .register("double", "Doubles", DOUBLE_CODE, &schema())
        .await
        .unwrap();

    // Durable record survives, but its script is gone
    std::fs::remove_file(s.dir.path().join("double.rhai")).unwrap();
    let report = s.registry.load_all().await.unwrap();

    assert_eq!(report.loaded, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "double");
    assert!(s.registry.get("double").await.is_none());
    // The divergence is observable, never silently hidden
    assert!(s.store.get_capability("double").unwrap().is_some());
}

#[tokio::test]
async fn concurrent_same_name_registrations_serialize() {
    let s = stack();
    let slow = "fn racy(params) { \"slow\" }";
    let fast = "fn racy(params) { \"fast\" }";

    let a = {
        let validator = Arc::clone(&s.validator);
        let schema = schema();
        tokio::spawn(async move { validator.register("racy", "a", slow, &schema).await })
    };
    let b = {
        let validator = Arc::clone(&s.validator);
        let schema = schema();
        tokio::spawn(async move { validator.register("racy", "b", fast, &schema).await })
    };

    assert!(matches!(a.await.unwrap().unwrap(), ValidationOutcome::Registered { .. }));
    assert!(matches!(b.await.unwrap().unwrap(), ValidationOutcome::Registered { .. }));

    // Whichever won, the registry is self-consistent: one record, one
    // binding, and the binding matches the stored script
    assert_eq!(s.store.all_capabilities().unwrap().len(), 1);
    let cap = s.registry.get("racy").await.unwrap();
    let result = s.engine.invoke(&cap.handle, &json!({})).unwrap();
    let on_disk = std::fs::read_to_string(s.dir.path().join("racy.rhai")).unwrap();
    assert!(on_disk.contains(&result));
}
