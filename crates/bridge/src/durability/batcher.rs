// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud write batcher.
//!
//! Writers submit `(path, record)` pairs and await the per-record outcome.
//! A worker flushes the queue when it reaches `FLUSH_SIZE` items or
//! `FLUSH_AFTER` has elapsed since the first queued item, with at most
//! `FLUSH_CONCURRENCY` flushes in flight. Duplicate paths inside one batch
//! resolve first-wins; a failed batch falls back to per-record writes where
//! an "already exists" collision counts as a blocked duplicate, not an error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cloud::{DocumentStore, StoreError};

const FLUSH_SIZE: usize = 500;
const FLUSH_AFTER: Duration = Duration::from_secs(1);
const FLUSH_CONCURRENCY: usize = 2;
/// Soft cap: submissions beyond this fail fast so callers drop to the spill
/// instead of growing the queue without bound.
const QUEUE_CAP: usize = 10_000;

/// Per-record outcome of a batched write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    /// Another record in the same batch targeted the same path; the first
    /// one won.
    DuplicateInBatch,
    /// The store already held a document at this path.
    DuplicateBlocked,
}

struct BatchItem {
    path: String,
    record: Value,
    resolve: oneshot::Sender<Result<WriteOutcome, StoreError>>,
}

#[derive(Default)]
struct BatcherCounters {
    depth: AtomicI64,
    peak_depth: AtomicI64,
    flushes: AtomicU64,
    created: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time batcher counters.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub depth: i64,
    pub peak_depth: i64,
    pub flushes: u64,
    pub created: u64,
    pub duplicates: u64,
    pub failures: u64,
}

pub struct CloudBatcher {
    tx: mpsc::Sender<BatchItem>,
    counters: Arc<BatcherCounters>,
}

impl CloudBatcher {
    pub fn new(store: Arc<dyn DocumentStore>, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        let counters = Arc::new(BatcherCounters::default());
        spawn_worker(store, rx, Arc::clone(&counters), shutdown);
        Self { tx, counters }
    }

    /// Enqueue a create-only write and await its outcome. Fails fast with
    /// `Unavailable` when the queue is saturated (back-pressure: the caller
    /// spills instead).
    pub async fn submit(&self, path: String, record: Value) -> Result<WriteOutcome, StoreError> {
        let (resolve, done) = oneshot::channel();
        let item = BatchItem { path, record, resolve };
        self.tx
            .try_send(item)
            .map_err(|_| StoreError::Unavailable("cloud batch queue saturated".to_owned()))?;

        let depth = self.counters.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.peak_depth.fetch_max(depth, Ordering::Relaxed);

        let result = done
            .await
            .map_err(|_| StoreError::Unavailable("batcher shut down".to_owned()))?;
        self.counters.depth.fetch_sub(1, Ordering::Relaxed);
        result
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            depth: self.counters.depth.load(Ordering::Relaxed),
            peak_depth: self.counters.peak_depth.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

fn spawn_worker(
    store: Arc<dyn DocumentStore>,
    mut rx: mpsc::Receiver<BatchItem>,
    counters: Arc<BatcherCounters>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(FLUSH_CONCURRENCY));
        let mut pending: Vec<BatchItem> = Vec::new();
        // Anchored to the FIRST queued item, not reset per arrival.
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let next = match deadline {
                None => tokio::select! {
                    _ = shutdown.cancelled() => None,
                    item = rx.recv() => item,
                },
                Some(at) => tokio::select! {
                    _ = shutdown.cancelled() => None,
                    _ = tokio::time::sleep_until(at) => {
                        dispatch(&store, &permits, &counters, std::mem::take(&mut pending));
                        deadline = None;
                        continue;
                    }
                    item = rx.recv() => item,
                },
            };

            match next {
                Some(item) => {
                    if pending.is_empty() {
                        deadline = Some(tokio::time::Instant::now() + FLUSH_AFTER);
                    }
                    pending.push(item);
                    if pending.len() >= FLUSH_SIZE {
                        dispatch(&store, &permits, &counters, std::mem::take(&mut pending));
                        deadline = None;
                    }
                }
                None => {
                    // Drain whatever is left, then stop.
                    if !pending.is_empty() {
                        dispatch(&store, &permits, &counters, std::mem::take(&mut pending));
                    }
                    break;
                }
            }
        }
    });
}

/// Spawn one flush under the concurrency limit.
fn dispatch(
    store: &Arc<dyn DocumentStore>,
    permits: &Arc<Semaphore>,
    counters: &Arc<BatcherCounters>,
    items: Vec<BatchItem>,
) {
    let store = Arc::clone(store);
    let permits = Arc::clone(permits);
    let counters = Arc::clone(counters);
    tokio::spawn(async move {
        let Ok(_permit) = permits.acquire().await else { return };
        counters.flushes.fetch_add(1, Ordering::Relaxed);
        flush(&store, &counters, items).await;
    });
}

async fn flush(store: &Arc<dyn DocumentStore>, counters: &BatcherCounters, items: Vec<BatchItem>) {
    // First occurrence of each path wins; the rest resolve immediately.
    let mut entries: BTreeMap<String, Value> = BTreeMap::new();
    let mut winners: Vec<BatchItem> = Vec::with_capacity(items.len());
    for item in items {
        if entries.contains_key(&item.path) {
            counters.duplicates.fetch_add(1, Ordering::Relaxed);
            let _ = item.resolve.send(Ok(WriteOutcome::DuplicateInBatch));
        } else {
            entries.insert(item.path.clone(), item.record.clone());
            winners.push(item);
        }
    }

    match store.batch_set(&entries).await {
        Ok(()) => {
            counters.created.fetch_add(winners.len() as u64, Ordering::Relaxed);
            for item in winners {
                let _ = item.resolve.send(Ok(WriteOutcome::Created));
            }
        }
        Err(batch_err) => {
            tracing::warn!(err = %batch_err, count = winners.len(),
                "batch write failed, falling back to individual writes");
            for item in winners {
                let outcome = match store.create(&item.path, &item.record).await {
                    Ok(()) => {
                        counters.created.fetch_add(1, Ordering::Relaxed);
                        Ok(WriteOutcome::Created)
                    }
                    Err(StoreError::AlreadyExists) => {
                        counters.duplicates.fetch_add(1, Ordering::Relaxed);
                        Ok(WriteOutcome::DuplicateBlocked)
                    }
                    Err(e) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                };
                let _ = item.resolve.send(outcome);
            }
        }
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod batcher_tests;
