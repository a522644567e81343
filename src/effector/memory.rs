//! In-memory key-value adapter.
//!
//! The reference storage backend: namespaces of ordered key/value pairs with
//! server-side idempotency deduplication. Tests and demos run on it; real
//! deployments swap in an adapter over their store of choice.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::effector::KvAdapter;
use crate::error::FlowResult;

#[derive(Default)]
struct Inner {
    namespaces: HashMap<String, BTreeMap<String, Bytes>>,
    applied_idem: HashSet<String>,
}

/// Namespaced in-memory store with idempotent writes
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/demo helper: insert a value without idempotency bookkeeping
    pub fn seed(&self, namespace: &str, key: &str, value: impl Into<Bytes>) {
        let mut inner = self.inner.lock().expect("kv poisoned");
        inner
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Number of keys in a namespace
    pub fn len(&self, namespace: &str) -> usize {
        let inner = self.inner.lock().expect("kv poisoned");
        inner.namespaces.get(namespace).map_or(0, BTreeMap::len)
    }

    /// Whether an idempotency key has been applied
    pub fn idem_applied(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("kv poisoned");
        inner.applied_idem.contains(key)
    }

    fn check_idem(inner: &mut Inner, idem: Option<&str>) -> bool {
        match idem {
            // true = already applied, acknowledge without re-applying
            Some(key) => !inner.applied_idem.insert(key.to_string()),
            None => false,
        }
    }
}

#[async_trait]
impl KvAdapter for MemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> FlowResult<Option<Bytes>> {
        let inner = self.inner.lock().expect("kv poisoned");
        Ok(inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Bytes,
        idem: Option<&str>,
    ) -> FlowResult<()> {
        let mut inner = self.inner.lock().expect("kv poisoned");
        if Self::check_idem(&mut inner, idem) {
            return Ok(());
        }
        inner
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, namespace: &str, key: &str, idem: Option<&str>) -> FlowResult<bool> {
        let mut inner = self.inner.lock().expect("kv poisoned");
        if Self::check_idem(&mut inner, idem) {
            return Ok(false);
        }
        Ok(inner
            .namespaces
            .get_mut(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    async fn scan(
        &self,
        namespace: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> FlowResult<Vec<(String, Bytes)>> {
        let inner = self.inner.lock().expect("kv poisoned");
        let Some(ns) = inner.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, Bytes)> = ns
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}
