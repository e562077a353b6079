// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handler tests against the assembled router — no real TCP.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::device::mock::MockDriver;
use crate::device::DeviceDriver;
use crate::state::BridgeState;
use crate::transport::build_router;

struct Fixture {
    state: Arc<BridgeState>,
    server: TestServer,
    mock: Arc<MockDriver>,
    _tmp: tempfile::TempDir,
}

fn fixture_with_args(extra: &[&str]) -> anyhow::Result<Fixture> {
    let tmp = tempfile::tempdir()?;
    let data_dir = tmp.path().join("app");
    let mut args = vec!["tallyd", "--use-mock-device", "--data-dir"];
    let data_dir_s = data_dir.to_string_lossy().into_owned();
    args.push(&data_dir_s);
    args.extend_from_slice(extra);

    let config = BridgeConfig::parse_from(args);
    let state = BridgeState::build(config, CancellationToken::new())?;
    let server = TestServer::new(build_router(Arc::clone(&state)))
        .map_err(|e| anyhow::anyhow!("test server: {e}"))?;
    let mock = Arc::new(MockDriver::new(Duration::from_secs(3600)));
    Ok(Fixture { state, server, mock, _tmp: tmp })
}

fn fixture() -> anyhow::Result<Fixture> {
    fixture_with_args(&[])
}

async fn connect(f: &Fixture) -> anyhow::Result<()> {
    f.state
        .session
        .connect_with_driver("127.0.0.1", Arc::clone(&f.mock) as Arc<dyn DeviceDriver>)
        .await
}

// ── liveness ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_running() -> anyhow::Result<()> {
    let f = fixture()?;
    let resp = f.server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["device_connected"], false);
    Ok(())
}

#[tokio::test]
async fn status_tracks_connection() -> anyhow::Result<()> {
    let f = fixture()?;
    let body: serde_json::Value = f.server.get("/status").await.json();
    assert_eq!(body["connected"], false);
    assert_eq!(body["mock"], true);

    connect(&f).await?;
    let body: serde_json::Value = f.server.get("/status").await.json();
    assert_eq!(body["connected"], true);
    assert_eq!(body["ip"], "127.0.0.1");
    assert_eq!(body["state"], "realtime");
    Ok(())
}

// ── device endpoints ──────────────────────────────────────────────────────

#[tokio::test]
async fn device_info_requires_connection() -> anyhow::Result<()> {
    let f = fixture()?;
    let resp = f.server.get("/device/info").await;
    resp.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);

    connect(&f).await?;
    let resp = f.server.get("/device/info").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["name"], "Mock Terminal");
    Ok(())
}

#[tokio::test]
async fn device_connect_rejects_bad_ip() -> anyhow::Result<()> {
    let f = fixture()?;
    let resp = f
        .server
        .post("/device/connect")
        .json(&serde_json::json!({"ip": "not-an-ip"}))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn device_connect_can_persist_static_address() -> anyhow::Result<()> {
    let f = fixture()?;
    // Connect will succeed against the mock driver selected by config.
    let resp = f
        .server
        .post("/device/connect")
        .json(&serde_json::json!({"ip": "192.168.1.174", "port": 4370, "remember": true}))
        .await;
    resp.assert_status_ok();

    let persisted = crate::settings::load(&f.state.layout.settings_path)?;
    assert_eq!(persisted.static_ip.as_deref(), Some("192.168.1.174"));
    assert_eq!(persisted.static_port, Some(4370));
    Ok(())
}

// ── user table ────────────────────────────────────────────────────────────

#[tokio::test]
async fn users_roundtrip_over_http() -> anyhow::Result<()> {
    let f = fixture()?;
    connect(&f).await?;

    let resp = f
        .server
        .post("/users/add")
        .json(&serde_json::json!({"biometricId": "15", "name": "Grace"}))
        .await;
    resp.assert_status_ok();

    let users: serde_json::Value = f.server.get("/users").await.json();
    let listed = users
        .as_array()
        .map(|a| a.iter().any(|u| u["biometric_id"] == "15"))
        .unwrap_or(false);
    assert!(listed, "added user must appear in the device list: {users}");

    f.server.delete("/users/15").await.assert_status_ok();
    let users: serde_json::Value = f.server.get("/users").await.json();
    let listed = users
        .as_array()
        .map(|a| a.iter().any(|u| u["biometric_id"] == "15"))
        .unwrap_or(false);
    assert!(!listed, "deleted user must disappear from the device list");
    Ok(())
}

// ── polling & sync ────────────────────────────────────────────────────────

#[tokio::test]
async fn polling_toggle_responds() -> anyhow::Result<()> {
    let f = fixture()?;
    f.server.post("/polling/start").await.assert_status_ok();
    f.server.post("/polling/stop").await.assert_status_ok();
    Ok(())
}

#[tokio::test]
async fn sync_endpoints_respond() -> anyhow::Result<()> {
    let f = fixture()?;
    let status: serde_json::Value = f.server.get("/sync/status").await.json();
    assert_eq!(status["pending"], 0);

    let resp = f.server.post("/sync/force").await;
    resp.assert_status_ok();
    let outcome: serde_json::Value = resp.json();
    assert_eq!(outcome["synced"], 0);
    Ok(())
}

// ── stats ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stats_endpoints_respond() -> anyhow::Result<()> {
    let f = fixture()?;
    for path in
        ["/stats/cache", "/stats/queue", "/stats/batcher", "/stats/breaker", "/stats/sync"]
    {
        let resp = f.server.get(path).await;
        resp.assert_status_ok();
    }
    // Mock mode wires an empty in-memory feed, so enrollment stats exist.
    f.server.get("/stats/enrollment").await.assert_status_ok();
    Ok(())
}

// ── auth ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bearer_auth_guards_everything_but_health() -> anyhow::Result<()> {
    let f = fixture_with_args(&["--auth-token", "sesame"])?;

    f.server.get("/health").await.assert_status_ok();
    let resp = f.server.get("/status").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let resp = f.server.get("/status").authorization_bearer("sesame").await;
    resp.assert_status_ok();

    let resp = f.server.get("/status").authorization_bearer("wrong").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}

// ── rate limiting ─────────────────────────────────────────────────────────

#[tokio::test]
async fn strict_tier_limits_device_log_calls() -> anyhow::Result<()> {
    let f = fixture()?;
    // /attendance/logs is strict (10/min) and fails fast while disconnected.
    // 21 rapid calls must overflow a 10-request window even if one wall-clock
    // minute boundary lands mid-test.
    let mut limited = 0;
    for _ in 0..21 {
        let resp = f.server.get("/attendance/logs").await;
        if resp.status_code() == axum::http::StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        } else {
            resp.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    assert!(limited >= 1, "strict tier never rate-limited");
    Ok(())
}
