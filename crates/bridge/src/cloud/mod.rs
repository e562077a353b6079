// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud seams: an abstract document store for users + attendance, and a
//! key/value feed pushing enrollment intents down to the site.
//!
//! The bridge only ever uses four store operations (create-only write, batch
//! set, equality query, liveness probe) so the trait stays that small. A REST
//! implementation talks to the real backend; the in-memory implementation
//! backs tests and unconfigured dev deployments.

pub mod memory;
pub mod rest;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store failures the callers care to distinguish.
#[derive(Debug)]
pub enum StoreError {
    /// A create-only write collided with an existing document. Callers treat
    /// this as success-equivalent (the record is already durable).
    AlreadyExists,
    /// The store could not be reached; triggers offline mode.
    Unavailable(String),
    /// Anything else (bad request, serialization, server fault).
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => f.write_str("document already exists"),
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Other(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract cloud document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create-only write (no merge); collision returns
    /// [`StoreError::AlreadyExists`].
    async fn create(&self, path: &str, record: &Value) -> StoreResult<()>;

    /// Write many documents in one shot, keyed by full path, no merge.
    async fn batch_set(&self, entries: &BTreeMap<String, Value>) -> StoreResult<()>;

    /// Equality query over a collection, bounded by `limit`.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> StoreResult<Vec<Value>>;

    /// Read a single document; `None` when absent.
    async fn read(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Cheap liveness probe.
    async fn probe(&self) -> StoreResult<()>;
}

/// One enrollment intent at `/member_registrations/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentIntent {
    pub biometric_id: String,
    pub name: String,
    #[serde(default)]
    pub essl_enrolled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essl_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essl_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essl_attempted_at: Option<String>,
}

/// Abstract enrollment feed.
#[async_trait]
pub trait EnrollmentFeed: Send + Sync {
    /// Snapshot of all intents currently on the feed, keyed by child key.
    async fn fetch_all(&self) -> anyhow::Result<Vec<(String, EnrollmentIntent)>>;

    /// Merge a partial update into one intent.
    async fn update(&self, key: &str, patch: &Value) -> anyhow::Result<()>;
}
