// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durability layer: one entry point, two sinks.
//!
//! `save` routes an attendance record into the cloud batcher while the store
//! is reachable and into the append-only spill otherwise (or when the cloud
//! write fails). Whatever happens, an accepted punch is never silently lost:
//! the caller learns exactly which sink took it.

pub mod batcher;
pub mod photos;
pub mod spill;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cloud::DocumentStore;
use crate::model::{AttendanceRecord, DurableEnvelope};
use crate::paths::DataLayout;

pub use batcher::{BatcherStats, CloudBatcher, WriteOutcome};
pub use photos::PhotoStore;
pub use spill::Spill;

/// Where an accepted record ended up.
#[derive(Debug)]
pub enum SaveResult {
    /// Acknowledged by the cloud store (possibly as a blocked duplicate).
    Cloud(WriteOutcome),
    /// Written to the local spill; will sync later.
    SpilledOffline { record_id: String },
    /// Both sinks failed.
    Failed { error: String },
}

pub struct Durability {
    pub spill: Spill,
    pub batcher: CloudBatcher,
    pub photos: PhotoStore,
    online: AtomicBool,
}

impl Durability {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        layout: &DataLayout,
        shutdown: CancellationToken,
    ) -> Self {
        let spill = Spill::new(layout);
        if let Err(e) = spill.migrate_legacy() {
            tracing::warn!(err = %e, "legacy spill migration failed");
        }
        Self {
            spill,
            batcher: CloudBatcher::new(store, shutdown),
            photos: PhotoStore::new(layout.clone()),
            online: AtomicBool::new(true),
        }
    }

    /// Reachability as last observed by the sync worker.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Persist one record: cloud batch first while online, spill otherwise.
    pub async fn save(&self, record: AttendanceRecord) -> SaveResult {
        if self.is_online() {
            let path = record.store_path();
            let value = match serde_json::to_value(&record) {
                Ok(v) => v,
                Err(e) => return SaveResult::Failed { error: e.to_string() },
            };
            match self.batcher.submit(path, value).await {
                Ok(outcome) => return SaveResult::Cloud(outcome),
                Err(e) => {
                    tracing::warn!(err = %e, "cloud save failed, spilling");
                    self.set_online(false);
                }
            }
        }
        self.spill_record(record).await
    }

    async fn spill_record(&self, record: AttendanceRecord) -> SaveResult {
        let envelope = DurableEnvelope::wrap(record, chrono::Utc::now().to_rfc3339());
        let record_id = envelope.record_id.clone();
        match self.spill.append(&envelope).await {
            Ok(()) => SaveResult::SpilledOffline { record_id },
            Err(e) => {
                tracing::error!(err = %e, "spill append failed");
                SaveResult::Failed { error: e.to_string() }
            }
        }
    }
}
