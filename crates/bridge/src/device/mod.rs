// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device driver seam.
//!
//! The terminal is reached through a single capability set; the session
//! manager, enrollment consumer, and HTTP surface all program against
//! [`DeviceDriver`] and never against a concrete transport. Two
//! implementations exist: the vendor TCP driver ([`zk::ZkDriver`]) and an
//! in-process synthetic device ([`mock::MockDriver`]) selected by
//! configuration at startup.

pub mod mock;
pub mod zk;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::BridgeConfig;

/// Identity and address of a discovered or connected terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

impl DeviceInfo {
    /// Placeholder for a host that answered the port probe but not the
    /// identity fetch.
    pub fn placeholder(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_owned(),
            port,
            mac: None,
            name: "Biometric Device".to_owned(),
            serial: None,
            model: None,
            firmware: None,
        }
    }
}

/// One frame from the terminal's realtime stream, as raw as the driver can
/// leave it. A missing or `"0"`/`"-1"` biometric id is a failed scan, not a
/// punch.
#[derive(Debug, Clone)]
pub struct RawDeviceEvent {
    pub biometric_id: Option<String>,
    pub instant: Option<String>,
}

/// One attendance log entry returned by `pull_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub biometric_id: String,
    pub instant: String,
}

/// A user record as stored on the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUser {
    pub uid: u16,
    pub biometric_id: String,
    pub name: String,
    pub role: u8,
    pub card_no: u32,
}

/// Payload for a user write.
#[derive(Debug, Clone)]
pub struct NewDeviceUser {
    pub uid: u16,
    pub biometric_id: String,
    pub name: String,
    pub password: String,
    pub role: u8,
    pub card_no: u32,
}

impl NewDeviceUser {
    /// The enrollment shape: uid parsed from the biometric id, everything
    /// else defaulted.
    pub fn for_enrollment(biometric_id: &str, name: &str) -> anyhow::Result<Self> {
        let uid: u16 = biometric_id
            .parse()
            .map_err(|_| anyhow::anyhow!("biometric id {biometric_id:?} is not a device uid"))?;
        Ok(Self {
            uid,
            biometric_id: biometric_id.to_owned(),
            name: name.to_owned(),
            password: String::new(),
            role: 0,
            card_no: 0,
        })
    }
}

/// The capability set every terminal implementation provides.
///
/// `on_event` registers the realtime sink and must not block; frames flow
/// from the driver's read loop into the given channel. All other calls may
/// suspend and carry their own timeouts.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn enable_realtime(&self) -> anyhow::Result<()>;
    fn on_event(&self, tx: mpsc::Sender<RawDeviceEvent>);
    async fn pull_log(&self) -> anyhow::Result<Vec<LogEntry>>;
    async fn set_user(&self, user: &NewDeviceUser) -> anyhow::Result<()>;
    async fn delete_user(&self, biometric_id: &str) -> anyhow::Result<()>;
    async fn get_users(&self) -> anyhow::Result<Vec<DeviceUser>>;
    async fn get_info(&self) -> anyhow::Result<DeviceInfo>;
    fn is_connected(&self) -> bool;
}

/// Select the driver implementation from config.
pub fn build_driver(config: &BridgeConfig, ip: &str) -> Arc<dyn DeviceDriver> {
    if config.use_mock_device {
        Arc::new(mock::MockDriver::new(config.mock_interval()))
    } else {
        Arc::new(zk::ZkDriver::new(
            ip.to_owned(),
            config.device_port,
            config.device_timeout(),
            config.inactivity_timeout(),
        ))
    }
}
