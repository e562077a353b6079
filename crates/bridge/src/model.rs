// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain types shared across the pipeline, cache, and durability layers.
//!
//! `biometric_id` is the device-assigned user identifier and is kept as an
//! opaque string everywhere; devices hand out `"1"`..`"N"` but nothing here
//! depends on that.

use serde::{Deserialize, Serialize};

use crate::clock::epoch_ms;

/// Sentinel biometric ids the terminal emits for a failed finger scan.
/// These are not punches.
pub const SCAN_FAILED_IDS: &[&str] = &["0", "-1"];

/// Where a punch entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunchSource {
    Realtime,
    Poll,
}

impl PunchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Poll => "poll",
        }
    }
}

/// A raw punch as handed off by the device session. The instant is kept
/// verbatim; the pipeline parses it (falling back to "now") so a device with
/// a broken clock cannot stall ingestion.
#[derive(Debug, Clone)]
pub struct RawPunch {
    pub biometric_id: String,
    pub instant: Option<String>,
    pub device_id: String,
    pub source: PunchSource,
}

/// Membership standing as recorded in the cloud store, plus the synthetic
/// `unknown` used when the punching user cannot be resolved at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Expired,
    Pending,
    Inactive,
    Unknown,
}

impl Default for MembershipStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A user profile as cached from the cloud store.
///
/// Exactly one of `photo_path` (offloaded to disk) or `photo_url` (already
/// remote) is populated; cached records never carry inline image bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub biometric_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub membership_status: MembershipStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_end_date: Option<String>,
}

/// The canonical attendance record, as published on the bus and written to
/// the cloud store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub biometric_id: String,
    /// RFC3339 instant of the punch.
    pub check_in_time: String,
    /// `YYYY-MM-DD` in the configured zone; always derived from
    /// `check_in_time`.
    pub date: String,
    pub status: String,
    pub source: PunchSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub membership_status: MembershipStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_end_date: Option<String>,
    pub remarks: String,
    pub created_at: String,
    pub updated_at: String,
}

impl AttendanceRecord {
    /// Cloud store path for this record: one document per user per day.
    pub fn store_path(&self) -> String {
        format!("attendance_logs/{}/records/{}", self.date, self.user_id)
    }

    /// The `unknown_` prefix marks records whose user lookup found nothing.
    pub fn is_unknown_user(&self) -> bool {
        self.user_id.starts_with("unknown_")
    }
}

/// An attendance record wrapped for the offline spill. `record_id` is the
/// sync identity key; the other fields are bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableEnvelope {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    /// Globally unique, monotonic-ish spill identity. Legacy spills called
    /// this `dbId`; accepted on read, never written.
    #[serde(alias = "dbId")]
    pub record_id: String,
    pub offline_timestamp: String,
    pub sync_status: SyncStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
}

impl DurableEnvelope {
    pub fn wrap(record: AttendanceRecord, now_rfc3339: String) -> Self {
        Self {
            record,
            record_id: new_record_id(),
            offline_timestamp: now_rfc3339,
            sync_status: SyncStatus::Pending,
        }
    }
}

/// Mint a spill record id: epoch-millis prefix keeps ids roughly ordered,
/// the uuid suffix makes them globally unique.
pub fn new_record_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("off-{}-{}", epoch_ms(), &suffix[..8])
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod model_tests;
