// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests wired in-process: mock terminal, real pipeline,
//! real spill on a temp directory, in-memory cloud store.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tally_bridge::cache::UserCache;
use tally_bridge::clock::Zone;
use tally_bridge::cloud::memory::MemoryStore;
use tally_bridge::cloud::DocumentStore;
use tally_bridge::config::BridgeConfig;
use tally_bridge::device::mock::MockDriver;
use tally_bridge::device::DeviceDriver;
use tally_bridge::durability::Durability;
use tally_bridge::events::{BusEvent, Envelope, EventBus};
use tally_bridge::paths::DataLayout;
use tally_bridge::pipeline::Pipeline;
use tally_bridge::session::DeviceSession;
use tally_bridge::sync::SyncWorker;

struct World {
    store: Arc<MemoryStore>,
    durability: Arc<Durability>,
    bus: EventBus,
    session: Arc<DeviceSession>,
    sync: Arc<SyncWorker>,
    mock: Arc<MockDriver>,
    _tmp: tempfile::TempDir,
}

async fn world() -> anyhow::Result<World> {
    let tmp = tempfile::tempdir()?;
    let layout = DataLayout::at(tmp.path().join("app"));
    layout.ensure()?;
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    let bus = EventBus::new();
    let cache = Arc::new(UserCache::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        layout.clone(),
        "http://127.0.0.1:9700".to_owned(),
    ));
    let durability = Arc::new(Durability::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        &layout,
        shutdown.clone(),
    ));
    let pipeline = Pipeline::spawn(
        cache,
        Arc::clone(&durability),
        bus.clone(),
        Zone::new("Asia/Kolkata")?,
        shutdown.clone(),
    );
    let config = BridgeConfig::parse_from(["tallyd"]);
    let session = DeviceSession::new(config, pipeline, bus.clone(), shutdown);
    let sync = SyncWorker::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        Arc::clone(&durability),
        bus.clone(),
        Duration::from_secs(30),
    );

    let mock = Arc::new(MockDriver::new(Duration::from_secs(3600)));
    session.connect_with_driver("192.168.1.174", Arc::clone(&mock) as Arc<dyn DeviceDriver>).await?;
    Ok(World { store, durability, bus, session, sync, mock, _tmp: tmp })
}

async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<Envelope>,
    kind: &str,
) -> anyhow::Result<BusEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        anyhow::ensure!(!remaining.is_zero(), "timed out waiting for {kind}");
        let envelope = tokio::time::timeout(remaining, rx.recv()).await??;
        if envelope.event.kind() == kind {
            return Ok(envelope.event);
        }
    }
}

// ── scenario: happy realtime ──────────────────────────────────────────────

#[tokio::test]
async fn happy_realtime_punch_reaches_the_cloud() -> anyhow::Result<()> {
    let w = world().await?;
    w.store.insert(
        "users/u_abc",
        serde_json::json!({
            "id": "u_abc", "biometricId": "42", "name": "Alice",
            "membershipStatus": "active",
        }),
    );
    let mut rx = w.bus.subscribe();

    w.mock.emit_punch("42", Some("2025-03-04T09:15:00Z".to_owned()));

    let processing = wait_for(&mut rx, "attendance_processing").await?;
    let BusEvent::AttendanceProcessing { biometric_id, .. } = processing else {
        anyhow::bail!("wrong event")
    };
    assert_eq!(biometric_id, "42");

    let event = wait_for(&mut rx, "attendance_event").await?;
    let BusEvent::AttendanceEvent { record } = event else { anyhow::bail!("wrong event") };
    assert_eq!(record.user_id, "u_abc");
    assert_eq!(record.name, "Alice");
    assert_eq!(record.date, "2025-03-04");
    assert_eq!(record.source.as_str(), "realtime");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if w.store.read("attendance_logs/2025-03-04/records/u_abc").await?.is_some() {
            return Ok(());
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "record never reached the store");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── scenario: dedup ───────────────────────────────────────────────────────

#[tokio::test]
async fn second_punch_within_the_window_is_ignored() -> anyhow::Result<()> {
    let w = world().await?;
    let mut rx = w.bus.subscribe();

    w.mock.emit_punch("42", Some("2025-03-04T09:15:00Z".to_owned()));
    w.mock.emit_punch("42", Some("2025-03-04T09:15:30Z".to_owned()));

    let mut events = 0;
    let mut duplicates = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline && (events == 0 || duplicates == 0) {
        let Ok(Ok(envelope)) =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        else {
            continue;
        };
        match envelope.event.kind() {
            "attendance_event" => events += 1,
            "attendance_duplicate_ignored" => duplicates += 1,
            _ => {}
        }
    }
    assert_eq!(events, 1, "exactly one attendance event");
    assert_eq!(duplicates, 1, "exactly one duplicate notice");
    Ok(())
}

// ── scenario: unknown user ────────────────────────────────────────────────

#[tokio::test]
async fn unknown_biometric_id_produces_a_tagged_record() -> anyhow::Result<()> {
    let w = world().await?;
    let mut rx = w.bus.subscribe();

    w.mock.emit_punch("999", Some("2025-03-04T09:15:00Z".to_owned()));

    let event = wait_for(&mut rx, "attendance_event").await?;
    let BusEvent::AttendanceEvent { record } = event else { anyhow::bail!("wrong event") };
    assert_eq!(record.user_id, "unknown_999");
    assert_eq!(format!("{:?}", record.membership_status).to_lowercase(), "unknown");
    assert!(record.remarks.contains("User not found"));
    Ok(())
}

// ── scenario: offline then recover ────────────────────────────────────────

#[tokio::test]
async fn offline_punch_survives_until_the_store_recovers() -> anyhow::Result<()> {
    let w = world().await?;
    let mut rx = w.bus.subscribe();

    // T: cloud store is down.
    w.store.set_reachable(false);
    w.durability.set_online(false);
    w.mock.emit_punch("7", Some("2025-03-04T09:15:00Z".to_owned()));

    let saved = wait_for(&mut rx, "attendance_saved_offline").await?;
    let BusEvent::AttendanceSavedOffline { record_id, .. } = saved else {
        anyhow::bail!("wrong event")
    };
    assert!(record_id.starts_with("off-"));
    assert_eq!(w.durability.spill.pending_count(), 1);

    // T+k: the store comes back; the next sync tick drains.
    w.store.set_reachable(true);
    w.sync.tick().await;

    let edge = wait_for(&mut rx, "connection_status").await?;
    let BusEvent::ConnectionStatus { online } = edge else { anyhow::bail!("wrong event") };
    assert!(online);

    let complete = wait_for(&mut rx, "sync_complete").await?;
    let BusEvent::SyncComplete { synced, failed } = complete else {
        anyhow::bail!("wrong event")
    };
    assert_eq!((synced, failed), (1, 0));

    assert!(w.store.read("attendance_logs/2025-03-04/records/unknown_7").await?.is_some());
    assert_eq!(w.durability.spill.pending_count(), 0);
    Ok(())
}

// ── law: spill → drain → read back ────────────────────────────────────────

#[tokio::test]
async fn drained_record_reads_back_from_the_cloud() -> anyhow::Result<()> {
    let w = world().await?;
    w.store.insert(
        "users/u_abc",
        serde_json::json!({
            "id": "u_abc", "biometricId": "42", "name": "Alice",
            "membershipStatus": "active",
        }),
    );
    let mut rx = w.bus.subscribe();

    w.durability.set_online(false);
    w.mock.emit_punch("42", Some("2025-03-04T09:15:00Z".to_owned()));
    wait_for(&mut rx, "attendance_saved_offline").await?;

    w.sync.tick().await;
    wait_for(&mut rx, "sync_complete").await?;

    let stored = w
        .store
        .read("attendance_logs/2025-03-04/records/u_abc")
        .await?
        .ok_or_else(|| anyhow::anyhow!("record missing after drain"))?;
    assert_eq!(stored["userId"], "u_abc");
    assert_eq!(stored["name"], "Alice");
    assert_eq!(stored["date"], "2025-03-04");
    assert_eq!(stored["status"], "present");
    assert_eq!(stored["membershipStatus"], "active");
    Ok(())
}

// ── session status surface ────────────────────────────────────────────────

#[tokio::test]
async fn session_reports_realtime_after_connect() -> anyhow::Result<()> {
    let w = world().await?;
    let status = w.session.status();
    assert!(status.connected);
    assert_eq!(status.ip.as_deref(), Some("192.168.1.174"));
    assert!(!status.permanent_polling);
    Ok(())
}
