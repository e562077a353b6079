// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use super::{DeviceSession, SessionState, MAX_REALTIME_FAILURES};
use crate::cache::UserCache;
use crate::clock::{epoch_ms, Zone};
use crate::cloud::memory::MemoryStore;
use crate::cloud::DocumentStore;
use crate::config::BridgeConfig;
use crate::device::mock::MockDriver;
use crate::device::{DeviceDriver, LogEntry};
use crate::durability::Durability;
use crate::events::{BusEvent, Envelope, EventBus};
use crate::pipeline::Pipeline;
use crate::paths::DataLayout;

struct Fixture {
    session: Arc<DeviceSession>,
    mock: Arc<MockDriver>,
    bus: EventBus,
    pipeline: Pipeline,
    _tmp: tempfile::TempDir,
}

fn fixture() -> anyhow::Result<Fixture> {
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
        durability,
        bus.clone(),
        Zone::new("Asia/Kolkata")?,
        shutdown.clone(),
    );

    let config = BridgeConfig::parse_from(["tallyd"]);
    let session = DeviceSession::new(config, pipeline.clone(), bus.clone(), shutdown);
    let mock = Arc::new(MockDriver::new(Duration::from_secs(3600)));
    Ok(Fixture { session, mock, bus, pipeline, _tmp: tmp })
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

// ── connect / disconnect ──────────────────────────────────────────────────

#[tokio::test]
async fn connect_reaches_realtime_state() -> anyhow::Result<()> {
    let f = fixture()?;
    let mut rx = f.bus.subscribe();

    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;

    assert_eq!(f.session.state(), SessionState::Realtime);
    assert!(f.session.is_connected());
    let status = f.session.status();
    assert_eq!(status.ip.as_deref(), Some("mock"));
    assert!(status.connected);

    wait_for(&mut rx, "connecting").await?;
    wait_for(&mut rx, "device-connected").await?;
    Ok(())
}

#[tokio::test]
async fn second_connect_is_a_noop() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;
    // A second connect while connected must not disturb the session.
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;
    assert_eq!(f.session.state(), SessionState::Realtime);
    Ok(())
}

#[tokio::test]
async fn disconnect_converges_to_idle() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;
    f.session.disconnect().await;

    assert_eq!(f.session.state(), SessionState::Idle);
    assert!(!f.session.is_connected());
    assert!(!f.mock.is_connected());
    Ok(())
}

// ── realtime flow ─────────────────────────────────────────────────────────

#[tokio::test]
async fn realtime_punch_flows_into_pipeline() -> anyhow::Result<()> {
    let f = fixture()?;
    let mut rx = f.bus.subscribe();
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;

    f.mock.emit_punch("42", Some("2025-03-04T09:15:00Z".to_owned()));

    let event = wait_for(&mut rx, "attendance_event").await?;
    let BusEvent::AttendanceEvent { record } = event else { anyhow::bail!("wrong event") };
    assert_eq!(record.biometric_id, "42");
    assert_eq!(record.source, crate::model::PunchSource::Realtime);
    assert_eq!(record.user_id, "unknown_42");
    Ok(())
}

#[tokio::test]
async fn listener_refreshes_liveness() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;

    // Age the liveness clock, then deliver a frame.
    f.session.live.last_event_at_ms.store(epoch_ms() - 120_000, Ordering::Relaxed);
    f.session.live.realtime_failures.store(2, Ordering::Relaxed);
    f.mock.emit_punch("8", None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let age = epoch_ms() - f.session.live.last_event_at_ms.load(Ordering::Relaxed);
    assert!(age < 10_000, "frame must refresh the liveness clock");
    assert_eq!(f.session.live.realtime_failures.load(Ordering::Relaxed), 0);
    Ok(())
}

// ── smart polling ─────────────────────────────────────────────────────────

#[tokio::test]
async fn healthy_realtime_skips_polling() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;

    f.session.smart_poll().await;
    assert!(!f.session.baseline_set.load(Ordering::Relaxed), "no pull should have happened");
    assert_eq!(f.session.state(), SessionState::Realtime);
    Ok(())
}

#[tokio::test]
async fn quiet_ticks_count_up_to_the_permanent_latch() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;

    for expected in 1..=MAX_REALTIME_FAILURES {
        f.session.live.last_event_at_ms.store(epoch_ms() - 61_000, Ordering::Relaxed);
        f.session.smart_poll().await;
        let failures = f.session.live.realtime_failures.load(Ordering::Relaxed);
        assert_eq!(failures, expected, "each quiet tick increments by exactly one");
    }
    assert!(f.session.permanent_polling.load(Ordering::Relaxed));
    assert_eq!(f.session.state(), SessionState::Polling);

    // Once latched, further ticks stop incrementing.
    f.session.smart_poll().await;
    assert_eq!(
        f.session.live.realtime_failures.load(Ordering::Relaxed),
        MAX_REALTIME_FAILURES
    );
    Ok(())
}

#[tokio::test]
async fn manual_polling_pulls_without_touching_failures() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session
        .connect_with_driver("mock", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await?;
    f.session.set_manual_polling(true);

    f.session.smart_poll().await;
    assert!(f.session.baseline_set.load(Ordering::Relaxed));
    assert_eq!(f.session.live.realtime_failures.load(Ordering::Relaxed), 0);
    Ok(())
}

// ── poll deltas ───────────────────────────────────────────────────────────

fn entries(ids: &[&str]) -> Vec<LogEntry> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| LogEntry {
            biometric_id: (*id).to_owned(),
            instant: format!("2025-03-04T09:{:02}:00Z", i),
        })
        .collect()
}

#[tokio::test]
async fn first_pull_sets_baseline_and_emits_nothing() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session.emit_poll_delta(entries(&["20", "21", "22"]));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.pipeline.stats().processed, 0, "baseline pull must be silent");
    assert_eq!(f.session.poll_baseline.load(Ordering::Relaxed), 3);
    Ok(())
}

#[tokio::test]
async fn later_pulls_emit_only_the_suffix() -> anyhow::Result<()> {
    let f = fixture()?;
    let mut rx = f.bus.subscribe();

    f.session.emit_poll_delta(entries(&["20", "21", "22"]));
    f.session.emit_poll_delta(entries(&["20", "21", "22", "23", "24"]));

    let first = wait_for(&mut rx, "attendance_event").await?;
    let BusEvent::AttendanceEvent { record } = first else { anyhow::bail!("wrong event") };
    assert_eq!(record.biometric_id, "23");
    assert_eq!(record.source, crate::model::PunchSource::Poll);

    let second = wait_for(&mut rx, "attendance_event").await?;
    let BusEvent::AttendanceEvent { record } = second else { anyhow::bail!("wrong event") };
    assert_eq!(record.biometric_id, "24");
    Ok(())
}

#[tokio::test]
async fn shrunken_log_just_resets_the_baseline() -> anyhow::Result<()> {
    let f = fixture()?;
    f.session.emit_poll_delta(entries(&["20", "21", "22"]));
    // Device log cleared out-of-band: shorter than the baseline.
    f.session.emit_poll_delta(entries(&["20"]));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.pipeline.stats().processed, 0);
    assert_eq!(f.session.poll_baseline.load(Ordering::Relaxed), 1);
    Ok(())
}
