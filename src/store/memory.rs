//! Process-local document store.
//!
//! Volatile, lock-guarded, and deterministic (ids come back sorted). The
//! standard backend for tests and for runs that delegate durability to an
//! external system.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{DocumentStore, Filter, Result, StoreError, partial_matches};

/// In-memory [`DocumentStore`] keyed by collection, then id.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<FxHashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let map = self.inner.read().map_err(Self::lock_err)?;
        Ok(map.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut map = self.inner.write().map_err(Self::lock_err)?;
        map.entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let mut map = self.inner.write().map_err(Self::lock_err)?;
        let doc = map
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        match (doc.as_object_mut(), patch.as_object()) {
            (Some(target), Some(fields)) => {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            // Non-object patch replaces the document wholesale.
            _ => *doc = patch,
        }
        Ok(())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>> {
        let map = self.inner.read().map_err(Self::lock_err)?;
        let Some(docs) = map.get(collection) else {
            return Ok(vec![]);
        };
        Ok(docs
            .iter()
            .filter(|(_, doc)| filters.iter().all(|f| f.matches(doc)))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool> {
        let mut map = self.inner.write().map_err(Self::lock_err)?;
        let docs = map.entry(collection.to_string()).or_default();
        let current = docs.get(id);
        let matched = match (expected, current) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(_), None) => false,
            (Some(exp), Some(doc)) => partial_matches(exp, doc),
        };
        if matched {
            docs.insert(id.to_string(), new);
        }
        Ok(matched)
    }
}
