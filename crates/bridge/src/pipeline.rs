// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event pipeline: dedup → enrich → fan out → durable write.
//!
//! Ingestion is a bounded-queue append and nothing more, so the device
//! callback path never waits on enrichment, store I/O, or publication. A
//! single worker drains the queue in small batches with an inter-batch
//! yield; enrichment inside a batch runs in parallel. Two accepted punches
//! for the same biometric id are always separated by the dedup window, so
//! per-id event order is preserved despite the parallelism.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::UserCache;
use crate::clock::{parse_instant, Zone};
use crate::durability::{Durability, SaveResult};
use crate::events::{BusEvent, EventBus};
use crate::model::{AttendanceRecord, MembershipStatus, RawPunch, SCAN_FAILED_IDS};

/// Repeat punches from the same id inside this window are dropped.
pub const DUPLICATE_WINDOW_MS: i64 = 60_000;
/// Dedup map size cap; oldest entries evicted beyond this.
const MAX_RECENT_CACHE_SIZE: usize = 1000;
/// Worker batch size.
const BATCH_SIZE: usize = 10;
/// Yield between batches.
const BATCH_YIELD: Duration = Duration::from_millis(100);
/// Dedup prune cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
/// Ingestion queue bound; beyond this punches are dropped with a log.
const QUEUE_CAP: usize = 10_000;

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub queue_depth: i64,
    pub peak_queue_depth: i64,
    pub processed: u64,
    pub duplicates_ignored: u64,
    pub unknown_users: u64,
    pub failed_scans: u64,
    pub dropped: u64,
    pub avg_processing_ms: f64,
    pub dedup_entries: usize,
}

struct Counters {
    depth: AtomicI64,
    peak_depth: AtomicI64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    unknown_users: AtomicU64,
    failed_scans: AtomicU64,
    dropped: AtomicU64,
    total_processing_us: AtomicU64,
}

struct PipelineInner {
    tx: mpsc::Sender<RawPunch>,
    dedup: Mutex<HashMap<String, i64>>,
    counters: Counters,
    cache: Arc<UserCache>,
    durability: Arc<Durability>,
    bus: EventBus,
    zone: Zone,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Build the pipeline and start its worker and prune tasks.
    pub fn spawn(
        cache: Arc<UserCache>,
        durability: Arc<Durability>,
        bus: EventBus,
        zone: Zone,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        let inner = Arc::new(PipelineInner {
            tx,
            dedup: Mutex::new(HashMap::new()),
            counters: Counters {
                depth: AtomicI64::new(0),
                peak_depth: AtomicI64::new(0),
                processed: AtomicU64::new(0),
                duplicates: AtomicU64::new(0),
                unknown_users: AtomicU64::new(0),
                failed_scans: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                total_processing_us: AtomicU64::new(0),
            },
            cache,
            durability,
            bus,
            zone,
        });

        spawn_worker(Arc::clone(&inner), rx, shutdown.clone());
        spawn_prune(Arc::clone(&inner), shutdown);
        Self { inner }
    }

    /// Accept a raw punch. O(1), never blocks; called from the device
    /// listener and the polling loop.
    pub fn ingest(&self, punch: RawPunch) {
        let id = punch.biometric_id.as_str();
        if id.is_empty() || SCAN_FAILED_IDS.contains(&id) {
            self.inner.counters.failed_scans.fetch_add(1, Ordering::Relaxed);
            self.inner.bus.publish(BusEvent::FingerprintFailed {
                device_id: punch.device_id,
                instant: punch.instant.unwrap_or_else(|| Utc::now().to_rfc3339()),
            });
            return;
        }

        match self.inner.tx.try_send(punch) {
            Ok(()) => {
                let depth = self.inner.counters.depth.fetch_add(1, Ordering::Relaxed) + 1;
                self.inner.counters.peak_depth.fetch_max(depth, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(err = %e, "pipeline queue saturated, punch dropped");
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let total_us = c.total_processing_us.load(Ordering::Relaxed);
        PipelineStats {
            queue_depth: c.depth.load(Ordering::Relaxed),
            peak_queue_depth: c.peak_depth.load(Ordering::Relaxed),
            processed,
            duplicates_ignored: c.duplicates.load(Ordering::Relaxed),
            unknown_users: c.unknown_users.load(Ordering::Relaxed),
            failed_scans: c.failed_scans.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            avg_processing_ms: if processed == 0 {
                0.0
            } else {
                (total_us as f64 / processed as f64) / 1000.0
            },
            dedup_entries: self.inner.dedup.lock().len(),
        }
    }
}

// -- Worker -------------------------------------------------------------------

fn spawn_worker(
    inner: Arc<PipelineInner>,
    mut rx: mpsc::Receiver<RawPunch>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            // Block for the first punch of a batch.
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                punch = rx.recv() => match punch {
                    Some(p) => p,
                    None => break,
                },
            };

            let mut batch = Vec::with_capacity(BATCH_SIZE);
            batch.push(first);
            while batch.len() < BATCH_SIZE {
                match rx.try_recv() {
                    Ok(punch) => batch.push(punch),
                    Err(_) => break,
                }
            }
            inner.counters.depth.fetch_sub(batch.len() as i64, Ordering::Relaxed);

            process_batch(&inner, batch).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(BATCH_YIELD) => {}
            }
        }
        tracing::debug!("pipeline worker stopped");
    });
}

async fn process_batch(inner: &Arc<PipelineInner>, batch: Vec<RawPunch>) {
    // Dedup runs sequentially (it is cheap and order matters); survivors are
    // enriched in parallel.
    let mut accepted: Vec<(RawPunch, DateTime<Utc>)> = Vec::with_capacity(batch.len());
    for punch in batch {
        let now = Utc::now();
        let t = parse_instant(punch.instant.as_deref(), now);
        match dedup_check(inner, &punch.biometric_id, t.timestamp_millis()) {
            DedupVerdict::Accept => {
                inner.bus.publish(BusEvent::AttendanceProcessing {
                    biometric_id: punch.biometric_id.clone(),
                    instant: t.to_rfc3339(),
                });
                accepted.push((punch, t));
            }
            DedupVerdict::Duplicate { since_ms } => {
                inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                inner.bus.publish(BusEvent::AttendanceDuplicateIgnored {
                    biometric_id: punch.biometric_id.clone(),
                    seconds_since_last: (since_ms / 1000).max(0) as u64,
                });
            }
        }
    }

    let work = accepted.into_iter().map(|(punch, t)| process_one(inner, punch, t));
    futures_util::future::join_all(work).await;
}

enum DedupVerdict {
    Accept,
    Duplicate { since_ms: i64 },
}

fn dedup_check(inner: &PipelineInner, biometric_id: &str, t_ms: i64) -> DedupVerdict {
    let mut dedup = inner.dedup.lock();
    if let Some(&last) = dedup.get(biometric_id) {
        let since = t_ms - last;
        if since < DUPLICATE_WINDOW_MS {
            return DedupVerdict::Duplicate { since_ms: since };
        }
    }
    dedup.insert(biometric_id.to_owned(), t_ms);
    DedupVerdict::Accept
}

async fn process_one(inner: &Arc<PipelineInner>, punch: RawPunch, t: DateTime<Utc>) {
    let started = std::time::Instant::now();
    let now = Utc::now().to_rfc3339();

    let user = inner.cache.lookup(&punch.biometric_id).await;
    if user.is_none() {
        inner.counters.unknown_users.fetch_add(1, Ordering::Relaxed);
    }

    let record = match user {
        Some(user) => AttendanceRecord {
            user_id: user.id,
            name: user.name,
            photo_url: user.photo_url,
            biometric_id: punch.biometric_id.clone(),
            check_in_time: t.to_rfc3339(),
            date: inner.zone.calendar_date(t),
            status: "present".to_owned(),
            source: punch.source,
            plan_id: user.plan_id,
            membership_status: user.membership_status,
            membership_end_date: user.membership_end_date,
            remarks: String::new(),
            created_at: now.clone(),
            updated_at: now,
        },
        None => AttendanceRecord {
            user_id: format!("unknown_{}", punch.biometric_id),
            name: "Unknown User".to_owned(),
            photo_url: None,
            biometric_id: punch.biometric_id.clone(),
            check_in_time: t.to_rfc3339(),
            date: inner.zone.calendar_date(t),
            status: "present".to_owned(),
            source: punch.source,
            plan_id: None,
            membership_status: MembershipStatus::Unknown,
            membership_end_date: None,
            remarks: "User not found in database".to_owned(),
            created_at: now.clone(),
            updated_at: now,
        },
    };

    inner.bus.publish(BusEvent::AttendanceEvent { record: record.clone() });

    match inner.durability.save(record.clone()).await {
        SaveResult::Cloud(outcome) => {
            tracing::debug!(user_id = %record.user_id, ?outcome, "attendance stored");
        }
        SaveResult::SpilledOffline { record_id } => {
            inner.bus.publish(BusEvent::AttendanceSavedOffline {
                record_id,
                biometric_id: record.biometric_id.clone(),
            });
        }
        SaveResult::Failed { error } => {
            inner.bus.publish(BusEvent::AttendanceSaveFailed {
                biometric_id: record.biometric_id.clone(),
                error,
            });
        }
    }

    inner.counters.processed.fetch_add(1, Ordering::Relaxed);
    inner
        .counters
        .total_processing_us
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
}

// -- Prune --------------------------------------------------------------------

fn spawn_prune(inner: Arc<PipelineInner>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            prune_dedup(&inner);
        }
    });
}

fn prune_dedup(inner: &PipelineInner) {
    let horizon = Utc::now().timestamp_millis() - DUPLICATE_WINDOW_MS;
    let mut dedup = inner.dedup.lock();
    dedup.retain(|_, &mut last| last > horizon);

    if dedup.len() > MAX_RECENT_CACHE_SIZE {
        let mut by_age: Vec<(String, i64)> =
            dedup.iter().map(|(k, &v)| (k.clone(), v)).collect();
        by_age.sort_by_key(|(_, at)| *at);
        let excess = dedup.len() - MAX_RECENT_CACHE_SIZE;
        for (key, _) in by_age.into_iter().take(excess) {
            dedup.remove(&key);
        }
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod pipeline_tests;
