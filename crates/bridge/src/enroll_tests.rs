// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use super::EnrollmentConsumer;
use crate::cache::UserCache;
use crate::clock::Zone;
use crate::cloud::memory::{MemoryFeed, MemoryStore};
use crate::cloud::{DocumentStore, EnrollmentFeed, EnrollmentIntent};
use crate::config::BridgeConfig;
use crate::device::mock::MockDriver;
use crate::device::DeviceDriver;
use crate::durability::Durability;
use crate::events::EventBus;
use crate::paths::DataLayout;
use crate::pipeline::Pipeline;
use crate::session::DeviceSession;

struct Fixture {
    feed: Arc<MemoryFeed>,
    mock: Arc<MockDriver>,
    session: Arc<crate::session::DeviceSession>,
    consumer: Arc<EnrollmentConsumer>,
    _tmp: tempfile::TempDir,
}

async fn fixture(connected: bool) -> anyhow::Result<Fixture> {
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
    let pipeline =
        Pipeline::spawn(cache, durability, bus.clone(), Zone::new("Asia/Kolkata")?, shutdown.clone());

    let config = BridgeConfig::parse_from(["tallyd"]);
    let session = DeviceSession::new(config, pipeline, bus, shutdown);
    let mock = Arc::new(MockDriver::new(Duration::from_secs(3600)));
    if connected {
        session.connect_with_driver("mock", Arc::clone(&mock) as Arc<dyn DeviceDriver>).await?;
    }

    let feed = Arc::new(MemoryFeed::new());
    let consumer =
        EnrollmentConsumer::new(Arc::clone(&feed) as Arc<dyn EnrollmentFeed>, Arc::clone(&session));
    Ok(Fixture { feed, mock, session, consumer, _tmp: tmp })
}

fn intent(biometric_id: &str, name: &str, enrolled: bool) -> EnrollmentIntent {
    EnrollmentIntent {
        biometric_id: biometric_id.to_owned(),
        name: name.to_owned(),
        essl_enrolled: enrolled,
        essl_status: None,
        essl_error: None,
        essl_attempted_at: None,
    }
}

// ── happy path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn pending_intent_is_enrolled_and_marked() -> anyhow::Result<()> {
    let f = fixture(true).await?;
    f.feed.push("reg1", &intent("15", "Grace", false))?;

    f.consumer.tick().await?;

    let users = f.mock.get_users().await?;
    assert!(users.iter().any(|u| u.biometric_id == "15" && u.name == "Grace"));

    let child = f.feed.get("reg1").ok_or_else(|| anyhow::anyhow!("missing child"))?;
    assert_eq!(child["esslEnrolled"], true);
    assert_eq!(child["esslStatus"], "success");
    assert!(child["esslEnrolledAt"].is_string());
    Ok(())
}

#[tokio::test]
async fn already_enrolled_intents_are_left_alone() -> anyhow::Result<()> {
    let f = fixture(true).await?;
    f.feed.push("reg1", &intent("15", "Grace", true))?;

    f.consumer.tick().await?;

    assert!(f.mock.get_users().await?.is_empty(), "no device write for enrolled intents");
    assert_eq!(f.consumer.stats().attempted, 0);
    Ok(())
}

#[tokio::test]
async fn each_intent_is_attempted_once() -> anyhow::Result<()> {
    let f = fixture(true).await?;
    f.feed.push("reg1", &intent("15", "Grace", false))?;

    f.consumer.tick().await?;
    // Pretend the write-back never happened: the intent still reads as
    // pending on the next poll, but it must not be re-attempted.
    f.feed.update("reg1", &serde_json::json!({"esslEnrolled": false})).await?;
    f.consumer.tick().await?;

    assert_eq!(f.consumer.stats().attempted, 1);
    Ok(())
}

// ── failure paths ─────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnected_session_short_circuits() -> anyhow::Result<()> {
    let f = fixture(false).await?;
    f.feed.push("reg1", &intent("15", "Grace", false))?;

    f.consumer.tick().await?;

    let child = f.feed.get("reg1").ok_or_else(|| anyhow::anyhow!("missing child"))?;
    assert_eq!(child["esslEnrolled"], false);
    assert_eq!(child["esslStatus"], "failed");
    assert_eq!(child["esslError"], "Device not connected");
    assert!(child["esslAttemptedAt"].is_string());
    assert_eq!(f.consumer.stats().failed, 1);
    Ok(())
}

#[tokio::test]
async fn non_numeric_biometric_id_fails_cleanly() -> anyhow::Result<()> {
    let f = fixture(true).await?;
    f.feed.push("reg1", &intent("badge-x", "Grace", false))?;

    f.consumer.tick().await?;

    let child = f.feed.get("reg1").ok_or_else(|| anyhow::anyhow!("missing child"))?;
    assert_eq!(child["esslStatus"], "failed");
    assert!(f.mock.get_users().await?.is_empty());
    Ok(())
}

// ── initial load ──────────────────────────────────────────────────────────

#[tokio::test]
async fn initial_load_counts_without_reprocessing_enrolled() -> anyhow::Result<()> {
    let f = fixture(true).await?;
    f.feed.push("old1", &intent("1", "A", true))?;
    f.feed.push("old2", &intent("2", "B", true))?;
    f.feed.push("new1", &intent("3", "C", false))?;

    f.consumer.tick().await?;

    assert_eq!(f.consumer.stats().attempted, 1, "only the pending intent is processed");
    let users = f.session.get_users().await?;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].biometric_id, "3");
    Ok(())
}
