//! Capability Registry
//!
//! The authoritative in-memory mapping from capability name to an invocable
//! handle plus its tool schema and description. Rebuildable at any time from
//! the durable store; a binding failure for one capability never aborts the
//! others.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::engine::{Handle, ScriptEngine};
use crate::store::Store;

/// A fully loaded, invocable capability
#[derive(Debug, Clone)]
pub struct LoadedCapability {
    pub handle: Handle,
    pub description: String,
    pub schema: serde_json::Value,
}

/// Outcome of a full reload: what loaded and what didn't
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// (capability name, load error) for every record that failed to bind
    pub failures: Vec<(String, String)>,
}

/// Live capability mapping shared across all turns
pub struct CapabilityRegistry {
    store: Arc<Store>,
    engine: Arc<ScriptEngine>,
    live: RwLock<HashMap<String, Arc<LoadedCapability>>>,
    /// Per-name serialization for the validate-then-register sequence
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CapabilityRegistry {
    pub fn new(store: Arc<Store>, engine: Arc<ScriptEngine>) -> Self {
        Self {
            store,
            engine,
            live: RwLock::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the whole live mapping from the durable store. Each record is
    /// bound independently; failures are reported, not fatal.
    pub async fn load_all(&self) -> anyhow::Result<LoadReport> {
        let records = self.store.all_capabilities()?;
        let mut fresh = HashMap::new();
        let mut report = LoadReport::default();

        for record in records {
            match self.bind_record(&record.name, &record.source_path) {
                Ok(handle) => {
                    fresh.insert(
                        record.name.clone(),
                        Arc::new(LoadedCapability {
                            handle,
                            description: record.description,
                            schema: record.parameter_schema,
                        }),
                    );
                    report.loaded += 1;
                }
                Err(e) => {
                    warn!("Failed to load capability '{}': {}", record.name, e);
                    report.failures.push((record.name, e));
                }
            }
        }

        *self.live.write().await = fresh;
        info!(
            "Capability registry loaded: {} ok, {} failed",
            report.loaded,
            report.failures.len()
        );
        Ok(report)
    }

    /// Re-bind a single capability from its (possibly just-updated) source.
    /// The swap is atomic: readers see either the old or the new binding.
    pub async fn reload_one(&self, name: &str) -> anyhow::Result<()> {
        let record = self
            .store
            .get_capability(name)?
            .ok_or_else(|| anyhow::anyhow!("no capability record named '{name}'"))?;

        let handle = self
            .bind_record(name, &record.source_path)
            .map_err(|e| anyhow::anyhow!("failed to bind '{name}': {e}"))?;

        let loaded = Arc::new(LoadedCapability {
            handle,
            description: record.description,
            schema: record.parameter_schema,
        });
        self.live.write().await.insert(name.to_string(), loaded);
        info!("Reloaded capability: {}", name);
        Ok(())
    }

    /// Drop a capability from the live mapping only; the durable record is
    /// untouched. Used when validation of an update fails after a prior
    /// successful load.
    pub async fn unbind(&self, name: &str) {
        if self.live.write().await.remove(name).is_some() {
            warn!("Unbound capability: {}", name);
        }
    }

    /// Get one loaded capability
    pub async fn get(&self, name: &str) -> Option<Arc<LoadedCapability>> {
        self.live.read().await.get(name).cloned()
    }

    /// Snapshot of the current live mapping, for the tool catalog
    pub async fn snapshot(&self) -> Vec<(String, Arc<LoadedCapability>)> {
        let mut entries: Vec<_> = self
            .live
            .read()
            .await
            .iter()
            .map(|(name, cap)| (name.clone(), Arc::clone(cap)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of live capabilities
    pub async fn count(&self) -> usize {
        self.live.read().await.len()
    }

    /// The serialization lock for one capability name. Two concurrent
    /// authoring attempts on the same name queue behind this; different
    /// names proceed in parallel.
    pub async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn bind_record(&self, name: &str, source_path: &str) -> Result<Handle, String> {
        let source = std::fs::read_to_string(source_path)
            .map_err(|e| format!("cannot read {source_path}: {e}"))?;
        self.engine.bind(name, &source).map_err(|e| e.to_string())
    }
}
