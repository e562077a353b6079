// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Synthetic in-process terminal for development and tests.
//!
//! Emits a punch every `interval` from a small rotating roster, with an
//! occasional failed scan mixed in, and keeps an in-memory attendance log so
//! `pull_log` behaves like real hardware. The generator starts when realtime
//! is enabled and stops on disconnect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DeviceDriver, DeviceInfo, DeviceUser, LogEntry, NewDeviceUser, RawDeviceEvent};

/// Rotating roster of synthetic biometric ids.
const ROSTER: &[&str] = &["1", "2", "3", "5", "8", "13"];

/// Every Nth synthetic frame is a failed scan.
const SCAN_FAIL_EVERY: u64 = 9;

pub struct MockDriver {
    interval: Duration,
    connected: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    event_tx: Arc<Mutex<Option<mpsc::Sender<RawDeviceEvent>>>>,
    log: Arc<Mutex<Vec<LogEntry>>>,
    generator: Mutex<Option<CancellationToken>>,
    users: Mutex<BTreeMap<String, DeviceUser>>,
}

impl MockDriver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            connected: Arc::new(AtomicBool::new(false)),
            ticks: Arc::new(AtomicU64::new(0)),
            event_tx: Arc::new(Mutex::new(None)),
            log: Arc::new(Mutex::new(Vec::new())),
            generator: Mutex::new(None),
            users: Mutex::new(BTreeMap::new()),
        }
    }

    fn require_connected(&self) -> anyhow::Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            anyhow::bail!("mock device not connected")
        }
    }

    /// Emit one synthetic frame. Exposed so tests can punch deterministically
    /// instead of waiting out the interval.
    pub fn emit_punch(&self, biometric_id: &str, instant: Option<String>) {
        emit(&self.event_tx, &self.log, biometric_id, instant);
    }
}

/// Push one frame into the registered sink, logging real punches.
fn emit(
    event_tx: &Arc<Mutex<Option<mpsc::Sender<RawDeviceEvent>>>>,
    log: &Arc<Mutex<Vec<LogEntry>>>,
    biometric_id: &str,
    instant: Option<String>,
) {
    let instant = instant.unwrap_or_else(|| Utc::now().to_rfc3339());
    if !crate::model::SCAN_FAILED_IDS.contains(&biometric_id) {
        log.lock().push(LogEntry {
            biometric_id: biometric_id.to_owned(),
            instant: instant.clone(),
        });
    }
    let tx = event_tx.lock().clone();
    if let Some(tx) = tx {
        let _ = tx.try_send(RawDeviceEvent {
            biometric_id: Some(biometric_id.to_owned()),
            instant: Some(instant),
        });
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.generator.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn enable_realtime(&self) -> anyhow::Result<()> {
        self.require_connected()?;

        let mut guard = self.generator.lock();
        if guard.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let interval = self.interval;
        let connected = Arc::clone(&self.connected);
        let ticks = Arc::clone(&self.ticks);
        let event_tx = Arc::clone(&self.event_tx);
        let log = Arc::clone(&self.log);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                let n = ticks.fetch_add(1, Ordering::Relaxed);
                if n % SCAN_FAIL_EVERY == SCAN_FAIL_EVERY - 1 {
                    emit(&event_tx, &log, "0", None);
                } else {
                    let id = ROSTER[(n as usize) % ROSTER.len()];
                    emit(&event_tx, &log, id, None);
                }
            }
        });
        Ok(())
    }

    fn on_event(&self, tx: mpsc::Sender<RawDeviceEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    async fn pull_log(&self) -> anyhow::Result<Vec<LogEntry>> {
        self.require_connected()?;
        Ok(self.log.lock().clone())
    }

    async fn set_user(&self, user: &NewDeviceUser) -> anyhow::Result<()> {
        self.require_connected()?;
        self.users.lock().insert(
            user.biometric_id.clone(),
            DeviceUser {
                uid: user.uid,
                biometric_id: user.biometric_id.clone(),
                name: user.name.clone(),
                role: user.role,
                card_no: user.card_no,
            },
        );
        Ok(())
    }

    async fn delete_user(&self, biometric_id: &str) -> anyhow::Result<()> {
        self.require_connected()?;
        self.users.lock().remove(biometric_id);
        Ok(())
    }

    async fn get_users(&self) -> anyhow::Result<Vec<DeviceUser>> {
        self.require_connected()?;
        Ok(self.users.lock().values().cloned().collect())
    }

    async fn get_info(&self) -> anyhow::Result<DeviceInfo> {
        self.require_connected()?;
        Ok(DeviceInfo {
            ip: "127.0.0.1".to_owned(),
            port: 0,
            mac: None,
            name: "Mock Terminal".to_owned(),
            serial: Some("MOCK-0001".to_owned()),
            model: Some("TK-100".to_owned()),
            firmware: Some("Ver 6.60 (mock)".to_owned()),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "mock_tests.rs"]
mod mock_tests;
