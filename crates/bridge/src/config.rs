// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the attendance bridge daemon.
///
/// Built once at startup from defaults ⊕ persisted user settings ⊕
/// environment/CLI; subsystems receive an immutable clone. Runtime address
/// changes go through the session's explicit reconnect path, never by
/// mutating this struct.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tallyd", about = "Biometric terminal to cloud attendance bridge")]
pub struct BridgeConfig {
    /// Host to bind the local API on.
    #[arg(long, default_value = "127.0.0.1", env = "TALLY_HOST")]
    pub host: String,

    /// Port for the local API.
    #[arg(long, default_value_t = 9700, env = "TALLY_PORT")]
    pub port: u16,

    /// Bearer token for the local API. If unset, auth is disabled.
    #[arg(long, env = "TALLY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Use the synthetic in-process device instead of real hardware.
    #[arg(long, env = "TALLY_USE_MOCK_DEVICE")]
    pub use_mock_device: bool,

    /// Sweep the LAN for a terminal when no address is configured.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "TALLY_AUTO_DISCOVER")]
    pub auto_discover_device: bool,

    /// Discovery attempts before giving up at startup.
    #[arg(long, default_value_t = 5, env = "TALLY_DISCOVERY_RETRIES")]
    pub auto_discovery_retries: u32,

    /// Delay between discovery attempts in milliseconds.
    #[arg(long, default_value_t = 3000, env = "TALLY_DISCOVERY_RETRY_DELAY_MS")]
    pub auto_discovery_retry_delay_ms: u64,

    /// Terminal IP address. Overrides discovery.
    #[arg(long, env = "TALLY_DEVICE_IP")]
    pub ip: Option<String>,

    /// Terminal TCP port.
    #[arg(long, default_value_t = 4370, env = "TALLY_DEVICE_PORT")]
    pub device_port: u16,

    /// Device connect timeout in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "TALLY_DEVICE_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Device socket read inactivity timeout in milliseconds.
    #[arg(long, default_value_t = 4000, env = "TALLY_INACTIVITY_TIMEOUT_MS")]
    pub inactivity_timeout_ms: u64,

    /// Per-host TCP probe timeout during discovery, in milliseconds.
    #[arg(long, default_value_t = 600, env = "TALLY_SCAN_TIMEOUT_MS")]
    pub scan_timeout_ms: u64,

    /// Concurrent probe workers during discovery.
    #[arg(long, default_value_t = 150, env = "TALLY_SCAN_CONCURRENCY")]
    pub scan_concurrency: usize,

    /// IANA timezone for attendance calendar dates.
    #[arg(long, default_value = "Asia/Kolkata", env = "TALLY_TIMEZONE")]
    pub timezone: String,

    /// Synthetic punch interval for the mock device, in milliseconds.
    #[arg(long, default_value_t = 15_000, env = "TALLY_MOCK_INTERVAL_MS")]
    pub mock_interval_ms: u64,

    /// Sync worker tick interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "TALLY_SYNC_INTERVAL_MS")]
    pub sync_interval_ms: u64,

    /// Device polling interval in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "TALLY_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Override the application data directory.
    #[arg(long, env = "TALLY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the cloud document store. If unset, an in-memory store is
    /// used (dev mode; nothing leaves the machine).
    #[arg(long, env = "TALLY_CLOUD_URL")]
    pub cloud_base_url: Option<String>,

    /// Bearer token for the cloud store and feed.
    #[arg(long, env = "TALLY_CLOUD_TOKEN")]
    pub cloud_auth_token: Option<String>,

    /// Base URL of the enrollment key/value feed. If unset, enrollment
    /// consumption is disabled.
    #[arg(long, env = "TALLY_FEED_URL")]
    pub feed_base_url: Option<String>,

    /// Enrollment feed poll interval in milliseconds.
    #[arg(long, default_value_t = 5000, env = "TALLY_FEED_POLL_MS")]
    pub feed_poll_ms: u64,
}

impl BridgeConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn mock_interval(&self) -> Duration {
        Duration::from_millis(self.mock_interval_ms)
    }

    pub fn auto_discovery_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auto_discovery_retry_delay_ms)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_ms)
    }

    /// Base URL of this daemon's own API, used to synthesize photo URLs.
    pub fn local_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Fold persisted user settings into the config. Explicit CLI/env values
    /// win; persisted static address fills the gaps.
    pub fn apply_settings(&mut self, settings: &crate::settings::UserSettings) {
        if self.ip.is_none() {
            self.ip = settings.static_ip.clone();
        }
        if let Some(port) = settings.static_port {
            if self.device_port == 4370 {
                self.device_port = port;
            }
        }
    }
}
