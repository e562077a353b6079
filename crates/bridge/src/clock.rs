// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Calendar-date math in the configured IANA timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Converts instants to calendar dates in a fixed IANA zone.
///
/// Attendance records carry both the UTC instant (`check_in_time`) and the
/// calendar date (`date`) as seen by the operator's site; the two must always
/// agree under this zone.
#[derive(Debug, Clone, Copy)]
pub struct Zone {
    tz: Tz,
}

impl Zone {
    /// Parse an IANA zone name (e.g. `Asia/Kolkata`).
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let tz: Tz =
            name.parse().map_err(|e| anyhow::anyhow!("invalid timezone {name:?}: {e}"))?;
        Ok(Self { tz })
    }

    /// The `YYYY-MM-DD` calendar date of `instant` in this zone.
    pub fn calendar_date(&self, instant: DateTime<Utc>) -> String {
        instant.with_timezone(&self.tz).format("%Y-%m-%d").to_string()
    }

    /// The zone's IANA name.
    pub fn name(&self) -> &'static str {
        self.tz.name()
    }
}

/// Parse a device-reported instant, falling back to `fallback` (typically
/// "now") when the string is missing or unparseable. Devices with drifted or
/// unset clocks produce garbage here; a wrong-but-plausible instant is better
/// than dropping the punch.
pub fn parse_instant(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod clock_tests;
