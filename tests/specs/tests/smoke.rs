// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `tallyd` binary and exercise
//! the HTTP and WebSocket surfaces against the mock device.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use tally_specs::BridgeProcess;

const TIMEOUT: Duration = Duration::from_secs(15);

// -- HTTP ---------------------------------------------------------------------

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start(&[])?;
    bridge.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/health", bridge.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "running");
    Ok(())
}

#[tokio::test]
async fn mock_device_comes_up_connected() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start(&[])?;
    bridge.wait_healthy(TIMEOUT).await?;
    bridge.wait_device_connected(TIMEOUT).await?;

    let status: serde_json::Value =
        reqwest::get(format!("{}/status", bridge.base_url())).await?.json().await?;
    assert_eq!(status["mock"], true);
    assert_eq!(status["connected"], true);
    Ok(())
}

#[tokio::test]
async fn users_roundtrip_over_http() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start(&[])?;
    bridge.wait_healthy(TIMEOUT).await?;
    bridge.wait_device_connected(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/users/add", bridge.base_url()))
        .json(&serde_json::json!({"biometricId": "21", "name": "Smoke User"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "add failed: {}", resp.status());

    let users: serde_json::Value =
        client.get(format!("{}/users", bridge.base_url())).send().await?.json().await?;
    let present = users
        .as_array()
        .map(|a| a.iter().any(|u| u["biometric_id"] == "21"))
        .unwrap_or(false);
    anyhow::ensure!(present, "user missing from device list: {users}");

    let resp =
        client.delete(format!("{}/users/21", bridge.base_url())).send().await?;
    anyhow::ensure!(resp.status().is_success(), "delete failed: {}", resp.status());
    Ok(())
}

#[tokio::test]
async fn stats_surface_responds() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start(&[])?;
    bridge.wait_healthy(TIMEOUT).await?;

    for path in ["/stats/cache", "/stats/queue", "/stats/batcher", "/stats/breaker"] {
        let resp = reqwest::get(format!("{}{path}", bridge.base_url())).await?;
        anyhow::ensure!(resp.status().is_success(), "{path} failed: {}", resp.status());
    }
    Ok(())
}

// -- WebSocket ----------------------------------------------------------------

#[tokio::test]
async fn ws_streams_attendance_events() -> anyhow::Result<()> {
    // Fast mock punches so the stream produces something quickly.
    let bridge = BridgeProcess::start(&["--mock-interval-ms", "250"])?;
    bridge.wait_healthy(TIMEOUT).await?;
    bridge.wait_device_connected(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(bridge.ws_url()).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no attendance event arrived");
        let Some(msg) = tokio::time::timeout(TIMEOUT, ws.next()).await? else {
            anyhow::bail!("ws closed early")
        };
        if let Message::Text(text) = msg? {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value["type"] == "attendance_event" {
                anyhow::ensure!(value["record"]["biometricId"].is_string());
                anyhow::ensure!(value["record"]["date"].is_string());
                return Ok(());
            }
        }
    }
}
