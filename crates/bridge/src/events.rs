// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Push-bus event types and the broadcast hub that fans them out to
//! WebSocket subscribers.
//!
//! Every event is a tagged variant; the wire names below are the contract
//! with the UI and must not drift. Attendance-related events are published
//! to the `"attendance"` topic rather than broadcast untargeted.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::device::DeviceInfo;
use crate::model::AttendanceRecord;

/// Topic carrying all attendance, device, and sync events.
pub const TOPIC_ATTENDANCE: &str = "attendance";

// -- Wire-format event types -------------------------------------------------

/// Events pushed to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// A punch was accepted by dedup and is being enriched.
    AttendanceProcessing { biometric_id: String, instant: String },
    /// The fully enriched attendance record.
    AttendanceEvent { record: AttendanceRecord },
    /// A repeat punch inside the dedup window was dropped.
    AttendanceDuplicateIgnored { biometric_id: String, seconds_since_last: u64 },
    /// The cloud write failed but the record landed in the local spill.
    AttendanceSavedOffline { record_id: String, biometric_id: String },
    /// Both the cloud write and the spill failed; the record is lost unless
    /// the caller retries.
    AttendanceSaveFailed { biometric_id: String, error: String },
    /// Device connectivity snapshot.
    DeviceStatus { connected: bool, ip: Option<String>, port: u16, mode: String },
    /// The terminal reported a finger scan it could not match.
    FingerprintFailed { device_id: String, instant: String },
    /// Discovery sweep started.
    #[serde(rename = "scan-started")]
    ScanStarted { prefixes: Vec<String> },
    /// Discovery found a listening terminal.
    #[serde(rename = "device-discovered")]
    DeviceDiscovered { device: DeviceInfo },
    /// Discovery finished without finding anything.
    #[serde(rename = "device-not-found")]
    DeviceNotFound { suggestions: Vec<String> },
    /// Discovery aborted on an internal error.
    #[serde(rename = "scan-failed")]
    ScanFailed { error: String, suggestions: Vec<String> },
    /// A connect attempt is underway.
    Connecting { ip: String, port: u16 },
    #[serde(rename = "device-connected")]
    DeviceConnected { ip: String, port: u16 },
    #[serde(rename = "connection-failed")]
    ConnectionFailed { ip: String, error: String, suggestions: Vec<String> },
    /// Per-batch drain progress.
    SyncProgress { file: String, synced: u64, failed: u64 },
    SyncComplete { synced: u64, failed: u64 },
    SyncError { error: String },
    /// Cloud-store reachability edge.
    ConnectionStatus { online: bool },
}

impl BusEvent {
    /// Wire name of this event (the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AttendanceProcessing { .. } => "attendance_processing",
            Self::AttendanceEvent { .. } => "attendance_event",
            Self::AttendanceDuplicateIgnored { .. } => "attendance_duplicate_ignored",
            Self::AttendanceSavedOffline { .. } => "attendance_saved_offline",
            Self::AttendanceSaveFailed { .. } => "attendance_save_failed",
            Self::DeviceStatus { .. } => "device_status",
            Self::FingerprintFailed { .. } => "fingerprint_failed",
            Self::ScanStarted { .. } => "scan-started",
            Self::DeviceDiscovered { .. } => "device-discovered",
            Self::DeviceNotFound { .. } => "device-not-found",
            Self::ScanFailed { .. } => "scan-failed",
            Self::Connecting { .. } => "connecting",
            Self::DeviceConnected { .. } => "device-connected",
            Self::ConnectionFailed { .. } => "connection-failed",
            Self::SyncProgress { .. } => "sync_progress",
            Self::SyncComplete { .. } => "sync_complete",
            Self::SyncError { .. } => "sync_error",
            Self::ConnectionStatus { .. } => "connection_status",
        }
    }
}

/// An event together with the topic it was published to.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(flatten)]
    pub event: BusEvent,
}

// -- Bus ----------------------------------------------------------------------

/// Broadcast hub — fans out events to WebSocket subscribers.
///
/// Sends never block and never fail: a bus with no subscribers drops events
/// on the floor, which is the desired behavior for UI pushes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish to the attendance topic.
    pub fn publish(&self, event: BusEvent) {
        self.publish_to(TOPIC_ATTENDANCE, event);
    }

    /// Publish to a named topic.
    pub fn publish_to(&self, topic: &str, event: BusEvent) {
        tracing::trace!(topic, kind = event.kind(), "bus publish");
        let _ = self.tx.send(Envelope { topic: topic.to_owned(), event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// -- Subscription filtering ---------------------------------------------------

/// Parsed subscription preferences for one WebSocket connection.
///
/// `topics_csv` — comma-separated topic names, or `"all"`.
/// `events_csv` — comma-separated event wire names, or `"all"`.
pub struct EventFilter {
    all_topics: bool,
    topics: Vec<String>,
    all_events: bool,
    events: Vec<String>,
}

impl EventFilter {
    pub fn new(topics_csv: &str, events_csv: &str) -> Self {
        let all_topics = topics_csv == "all";
        let topics = if all_topics {
            vec![]
        } else {
            topics_csv.split(',').map(|s| s.trim().to_owned()).collect()
        };
        let all_events = events_csv == "all";
        let events = if all_events {
            vec![]
        } else {
            events_csv.split(',').map(|s| s.trim().to_owned()).collect()
        };
        Self { all_topics, topics, all_events, events }
    }

    pub fn wants(&self, envelope: &Envelope) -> bool {
        let topic_ok = self.all_topics || self.topics.iter().any(|t| t == &envelope.topic);
        let event_ok =
            self.all_events || self.events.iter().any(|e| e == envelope.event.kind());
        topic_ok && event_ok
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod events_tests;
