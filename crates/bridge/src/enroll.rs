// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Enrollment consumer: drains pushed enrollment intents from the cloud feed
//! into the terminal, at bounded concurrency, through the session's
//! serialized driver lock.
//!
//! Each intent is attempted exactly once per process lifetime; the outcome
//! (success or failure, including "device not connected") is written back to
//! the feed so the upstream UI can surface it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::cloud::{EnrollmentFeed, EnrollmentIntent};
use crate::device::NewDeviceUser;
use crate::session::DeviceSession;

/// Intents pushed to the device concurrently per batch.
const BATCH_SIZE: usize = 3;
/// Pause between batches.
const BATCH_YIELD: Duration = Duration::from_millis(500);

/// Counters for `/stats`-style introspection.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct EnrollmentConsumer {
    feed: Arc<dyn EnrollmentFeed>,
    session: Arc<DeviceSession>,
    seen: Mutex<HashSet<String>>,
    initial_load_done: AtomicBool,
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl EnrollmentConsumer {
    pub fn new(feed: Arc<dyn EnrollmentFeed>, session: Arc<DeviceSession>) -> Arc<Self> {
        Arc::new(Self {
            feed,
            session,
            seen: Mutex::new(HashSet::new()),
            initial_load_done: AtomicBool::new(false),
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> EnrollmentStats {
        EnrollmentStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// One feed pass: pick up unseen pending intents and push them to the
    /// device in bounded parallel batches.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let all = self.feed.fetch_all().await?;

        if !self.initial_load_done.swap(true, Ordering::SeqCst) {
            let enrolled = all.iter().filter(|(_, i)| i.essl_enrolled).count();
            let pending = all.len() - enrolled;
            tracing::info!(enrolled, pending, "enrollment feed initial load");
            let mut seen = self.seen.lock();
            for (key, intent) in &all {
                if intent.essl_enrolled {
                    seen.insert(key.clone());
                }
            }
        }

        let fresh: Vec<(String, EnrollmentIntent)> = {
            let mut seen = self.seen.lock();
            let mut fresh = Vec::new();
            for (key, intent) in all {
                if intent.essl_enrolled || seen.contains(&key) {
                    continue;
                }
                seen.insert(key.clone());
                fresh.push((key, intent));
            }
            fresh
        };
        if fresh.is_empty() {
            return Ok(());
        }
        tracing::info!(count = fresh.len(), "new enrollment intents");

        let mut chunks = fresh.chunks(BATCH_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            let work = chunk.iter().map(|(key, intent)| self.process_intent(key, intent));
            futures_util::future::join_all(work).await;
            if chunks.peek().is_some() {
                tokio::time::sleep(BATCH_YIELD).await;
            }
        }
        Ok(())
    }

    async fn process_intent(&self, key: &str, intent: &EnrollmentIntent) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().to_rfc3339();

        if !self.session.is_connected() {
            self.mark_failed(key, "Device not connected", &now).await;
            return;
        }

        let user = match NewDeviceUser::for_enrollment(&intent.biometric_id, &intent.name) {
            Ok(user) => user,
            Err(e) => {
                self.mark_failed(key, &format!("{e:#}"), &now).await;
                return;
            }
        };

        match self.session.set_user(&user).await {
            Ok(()) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                let patch = json!({
                    "esslEnrolled": true,
                    "esslEnrolledAt": now,
                    "esslStatus": "success",
                });
                if let Err(e) = self.feed.update(key, &patch).await {
                    tracing::warn!(key, err = %e, "enrollment status write-back failed");
                }
                tracing::info!(key, biometric_id = %intent.biometric_id, "user enrolled");
            }
            Err(e) => {
                self.mark_failed(key, &format!("{e:#}"), &now).await;
            }
        }
    }

    async fn mark_failed(&self, key: &str, error: &str, now: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let patch = json!({
            "esslEnrolled": false,
            "esslStatus": "failed",
            "esslError": error,
            "esslAttemptedAt": now,
        });
        if let Err(e) = self.feed.update(key, &patch).await {
            tracing::warn!(key, err = %e, "enrollment failure write-back failed");
        }
        tracing::warn!(key, error, "enrollment failed");
    }
}

/// Start the feed polling loop.
pub fn spawn_consumer(
    consumer: Arc<EnrollmentConsumer>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = consumer.tick().await {
                tracing::warn!(err = %e, "enrollment feed poll failed");
            }
        }
        tracing::debug!("enrollment consumer stopped");
    });
}

#[cfg(test)]
#[path = "enroll_tests.rs"]
mod enroll_tests;
