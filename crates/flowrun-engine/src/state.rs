use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

/// A partial state update produced by a node.
pub type Patch = HashMap<String, Value>;

/// Key/value state of a single run.
///
/// Writes are shallow merges under one lock, so concurrent branches never
/// lose a patch. Conflicting keys are last-write-wins.
#[derive(Clone, Default)]
pub struct RunState {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for the requested keys. Missing keys are omitted.
    pub async fn read(&self, keys: &[String]) -> HashMap<String, Value> {
        let state = self.inner.read().await;
        keys.iter()
            .filter_map(|k| state.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.clone()
    }

    /// Shallow merge: keys in `patch` overwrite, others are preserved.
    pub async fn write(&self, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        let mut state = self.inner.write().await;
        state.extend(patch);
    }

    /// Snapshot as a JSON object.
    pub async fn to_value(&self) -> Value {
        let state = self.inner.read().await;
        Value::Object(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
