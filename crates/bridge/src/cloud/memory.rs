// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory store and feed: dev mode and the test harness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{DocumentStore, EnrollmentFeed, EnrollmentIntent, StoreError, StoreResult};

/// Document store backed by a plain map. `set_reachable(false)` simulates an
/// outage: every operation fails with `Unavailable` until flipped back.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
    unreachable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Seed a document directly, bypassing reachability.
    pub fn insert(&self, path: &str, value: Value) {
        self.docs.write().insert(path.to_owned(), value);
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, path: &str, record: &Value) -> StoreResult<()> {
        self.check_reachable()?;
        let mut docs = self.docs.write();
        if docs.contains_key(path) {
            return Err(StoreError::AlreadyExists);
        }
        docs.insert(path.to_owned(), record.clone());
        Ok(())
    }

    async fn batch_set(&self, entries: &BTreeMap<String, Value>) -> StoreResult<()> {
        self.check_reachable()?;
        let mut docs = self.docs.write();
        for (path, value) in entries {
            docs.insert(path.clone(), value.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> StoreResult<Vec<Value>> {
        self.check_reachable()?;
        let prefix = format!("{}/", collection.trim_end_matches('/'));
        let docs = self.docs.read();
        let mut out = Vec::new();
        for (path, doc) in docs.iter() {
            if !path.starts_with(&prefix) {
                continue;
            }
            let matches = match value {
                Value::Null => true,
                wanted => doc.get(field) == Some(wanted),
            };
            if matches {
                out.push(doc.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
        self.check_reachable()?;
        Ok(self.docs.read().get(path).cloned())
    }

    async fn probe(&self) -> StoreResult<()> {
        self.check_reachable()
    }
}

// -- Enrollment feed ----------------------------------------------------------

/// Feed backed by a map of raw JSON children.
#[derive(Default)]
pub struct MemoryFeed {
    children: RwLock<BTreeMap<String, Value>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: &str, intent: &EnrollmentIntent) -> anyhow::Result<()> {
        let value = serde_json::to_value(intent)?;
        self.children.write().insert(key.to_owned(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.children.read().get(key).cloned()
    }
}

#[async_trait]
impl EnrollmentFeed for MemoryFeed {
    async fn fetch_all(&self) -> anyhow::Result<Vec<(String, EnrollmentIntent)>> {
        let children = self.children.read();
        let mut out = Vec::with_capacity(children.len());
        for (key, child) in children.iter() {
            if let Ok(intent) = serde_json::from_value::<EnrollmentIntent>(child.clone()) {
                out.push((key.clone(), intent));
            }
        }
        Ok(out)
    }

    async fn update(&self, key: &str, patch: &Value) -> anyhow::Result<()> {
        let mut children = self.children.write();
        let entry = children.entry(key.to_owned()).or_insert(Value::Null);
        match (entry.as_object_mut(), patch.as_object()) {
            (Some(obj), Some(patch_obj)) => {
                for (k, v) in patch_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
            _ => *entry = patch.clone(),
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
