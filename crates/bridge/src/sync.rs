// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sync worker: probes cloud liveness on a timer, publishes reachability
//! edges, and drains the offline spill oldest-batch-first.
//!
//! Draining uses the individual write path (not the batcher) so append order
//! inside a batch is preserved. A batch file is deleted only once every
//! contained record is cloud-acknowledged or requeued into the active
//! segment; if requeue itself fails the batch stays on disk for the next
//! pass. Repeated worker faults back the worker off for five minutes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::clock::epoch_ms;
use crate::cloud::{DocumentStore, StoreError};
use crate::durability::{spill, Durability};
use crate::events::{BusEvent, EventBus};

/// Worker faults tolerated before the pause kicks in.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// How long a repeatedly failing worker stays quiet.
const FAILURE_PAUSE: Duration = Duration::from_secs(300);

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncOutcome {
    pub synced: u64,
    pub failed: u64,
}

/// Snapshot for `/sync/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub pending: usize,
    pub consecutive_failures: u32,
    pub last_sync_at_ms: Option<u64>,
    pub last_synced: u64,
    pub last_failed: u64,
}

pub struct SyncWorker {
    store: Arc<dyn DocumentStore>,
    durability: Arc<Durability>,
    bus: EventBus,
    interval: Duration,

    /// Single-flight guard for drains.
    drain_lock: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    consecutive_failures: AtomicU32,
    paused_until_ms: AtomicU64,
    last_sync_at_ms: AtomicU64,
    last_synced: AtomicU64,
    last_failed: AtomicU64,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        durability: Arc<Durability>,
        bus: EventBus,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            durability,
            bus,
            interval,
            drain_lock: tokio::sync::Mutex::new(()),
            syncing: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            paused_until_ms: AtomicU64::new(0),
            last_sync_at_ms: AtomicU64::new(0),
            last_synced: AtomicU64::new(0),
            last_failed: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> SyncStatus {
        let last = self.last_sync_at_ms.load(Ordering::Relaxed);
        SyncStatus {
            online: self.durability.is_online(),
            syncing: self.syncing.load(Ordering::Relaxed),
            pending: self.durability.spill.pending_count(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_sync_at_ms: if last == 0 { None } else { Some(last) },
            last_synced: self.last_synced.load(Ordering::Relaxed),
            last_failed: self.last_failed.load(Ordering::Relaxed),
        }
    }

    /// One scheduled tick: probe, publish edges, drain while online.
    pub async fn tick(&self) {
        if epoch_ms() < self.paused_until_ms.load(Ordering::Relaxed) {
            return;
        }

        let was_online = self.durability.is_online();
        let online = self.store.probe().await.is_ok();
        if online != was_online {
            tracing::info!(online, "cloud reachability changed");
            self.durability.set_online(online);
            self.bus.publish(BusEvent::ConnectionStatus { online });
        }
        if !online {
            return;
        }

        match self.drain().await {
            Ok(Some(outcome)) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if outcome.synced + outcome.failed > 0 {
                    tracing::info!(synced = outcome.synced, failed = outcome.failed, "drain done");
                }
            }
            Ok(None) => {} // drain already in flight
            Err(e) => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(err = %e, count, "sync pass failed");
                self.bus.publish(BusEvent::SyncError { error: format!("{e:#}") });
                if count >= MAX_CONSECUTIVE_FAILURES {
                    self.paused_until_ms
                        .store(epoch_ms() + FAILURE_PAUSE.as_millis() as u64, Ordering::Relaxed);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    tracing::warn!(pause_secs = FAILURE_PAUSE.as_secs(), "sync worker pausing");
                }
            }
        }
    }

    /// Manual drain (`POST /sync/force`). Respects single-flight; clears any
    /// failure pause first.
    pub async fn force_sync_now(&self) -> anyhow::Result<SyncOutcome> {
        self.paused_until_ms.store(0, Ordering::Relaxed);
        match self.drain().await? {
            Some(outcome) => Ok(outcome),
            None => anyhow::bail!("sync already in progress"),
        }
    }

    /// Rotate the active spill, then drain every batch oldest-first.
    /// `Ok(None)` means another drain holds the lock.
    async fn drain(&self) -> anyhow::Result<Option<SyncOutcome>> {
        let Ok(_guard) = self.drain_lock.try_lock() else { return Ok(None) };
        self.syncing.store(true, Ordering::Relaxed);
        let result = self.drain_inner().await;
        self.syncing.store(false, Ordering::Relaxed);
        self.last_sync_at_ms.store(epoch_ms(), Ordering::Relaxed);
        result.map(Some)
    }

    async fn drain_inner(&self) -> anyhow::Result<SyncOutcome> {
        self.durability.spill.rotate().await?;

        let mut total = SyncOutcome::default();
        for batch in self.durability.spill.batches() {
            let mut outcome = SyncOutcome::default();
            let mut requeue = Vec::new();

            let file = tokio::fs::File::open(&batch).await?;
            let mut lines = tokio::io::BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                let Some(envelope) = spill::parse_line(&line) else { continue };
                let path = envelope.record.store_path();
                let value = serde_json::to_value(&envelope.record)?;
                match self.store.create(&path, &value).await {
                    Ok(()) | Err(StoreError::AlreadyExists) => outcome.synced += 1,
                    Err(e) => {
                        tracing::debug!(record_id = %envelope.record_id, err = %e, "record sync failed");
                        outcome.failed += 1;
                        requeue.push(envelope);
                    }
                }
            }

            // Failures go back into the active segment before the batch is
            // deleted; if that requeue fails the batch must survive.
            if !requeue.is_empty() {
                self.durability.spill.requeue(&requeue).await?;
            }
            self.durability.spill.delete_batch(&batch).await?;

            let file_name = batch
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.bus.publish(BusEvent::SyncProgress {
                file: file_name,
                synced: outcome.synced,
                failed: outcome.failed,
            });
            total.synced += outcome.synced;
            total.failed += outcome.failed;
        }

        self.last_synced.store(total.synced, Ordering::Relaxed);
        self.last_failed.store(total.failed, Ordering::Relaxed);
        self.bus
            .publish(BusEvent::SyncComplete { synced: total.synced, failed: total.failed });
        Ok(total)
    }
}

/// Start the periodic sync loop.
pub fn spawn_sync_worker(worker: Arc<SyncWorker>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(worker.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            worker.tick().await;
        }
        tracing::debug!("sync worker stopped");
    });
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod sync_tests;
