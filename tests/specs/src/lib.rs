// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end smoke tests.
//!
//! Spawns the real `tallyd` binary against a temporary data directory and
//! exercises it over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `tallyd` binary.
pub fn tallyd_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("tallyd")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `tallyd` process bound to a fresh port and data directory.
pub struct BridgeProcess {
    child: Child,
    port: u16,
    _data_dir: tempfile::TempDir,
}

impl BridgeProcess {
    /// Start with the mock device and any extra CLI arguments.
    pub fn start(extra_args: &[&str]) -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let port = free_port()?;
        let child = Command::new(tallyd_binary())
            .arg("--use-mock-device")
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(data_dir.path())
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Self { child, port, _data_dir: data_dir })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Poll `/health` until it answers or the timeout expires.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("tallyd never became healthy");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll `/status` until the device session reports connected.
    pub async fn wait_device_connected(&self, timeout: Duration) -> anyhow::Result<()> {
        let url = format!("{}/status", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    if body["connected"] == true {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("device session never connected");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
