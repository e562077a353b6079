// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted operator settings: load/save `user-settings.json` with atomic
//! writes. These fold into the effective config at startup and are updated
//! when the operator pins a device address via `POST /device/connect`.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How the terminal is attached to the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Wired,
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Wired
    }
}

/// Operator connection preferences.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Key is `staticIP` on disk for compatibility with existing installs.
    #[serde(default, rename = "staticIP", skip_serializing_if = "Option::is_none")]
    pub static_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_port: Option<u16>,
}

/// Load settings from a JSON file; a missing file yields defaults.
pub fn load(path: &Path) -> anyhow::Result<UserSettings> {
    if !path.exists() {
        return Ok(UserSettings::default());
    }
    let contents = std::fs::read_to_string(path)?;
    let settings: UserSettings = serde_json::from_str(&contents)?;
    Ok(settings)
}

/// Save settings to a JSON file atomically (write tmp + rename).
pub fn save(path: &Path, settings: &UserSettings) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod settings_tests;
