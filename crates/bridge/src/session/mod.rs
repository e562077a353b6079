// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device session manager.
//!
//! Owns the single terminal connection for the whole process. Connects under
//! a retry policy gated by a circuit breaker, attaches the realtime listener,
//! and runs two independent background loops: a smart-polling tick that takes
//! over when realtime goes quiet (latching into permanent polling mode after
//! repeated timeouts), and a reconnect watchdog that restores the session
//! after drops. All driver calls from outside the realtime path serialize
//! through one session-wide lock, so enrollment writes and log pulls never
//! interleave on the wire.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::epoch_ms;
use crate::config::BridgeConfig;
use crate::device::{self, DeviceDriver, DeviceInfo, DeviceUser, LogEntry, NewDeviceUser};
use crate::discovery::Scanner;
use crate::events::{BusEvent, EventBus};
use crate::model::{PunchSource, RawPunch};
use crate::pipeline::Pipeline;
use crate::policy::{retry, BreakerStats, CircuitBreaker, RetryPolicy};

/// Realtime is considered dead after this long without a frame.
const REALTIME_TIMEOUT: Duration = Duration::from_secs(60);
/// Observed timeouts before polling latches permanently.
const MAX_REALTIME_FAILURES: u32 = 3;
/// Reconnect watchdog cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
/// Bound on the optional connect-time calls (`get_info`, `enable_realtime`).
const OPTIONAL_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on graceful disconnect before the socket is dropped.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Listener channel capacity; frames beyond this are dropped by the driver.
const EVENT_CHANNEL_CAP: usize = 1024;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Enabled,
    Realtime,
    Polling,
    Both,
    Degraded,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Enabled => "enabled",
            Self::Realtime => "realtime",
            Self::Polling => "polling",
            Self::Both => "both",
            Self::Degraded => "degraded",
            Self::Disconnecting => "disconnecting",
        }
    }
}

/// Snapshot for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub ip: Option<String>,
    pub port: u16,
    pub mock: bool,
    pub state: SessionState,
    pub permanent_polling: bool,
    pub realtime_failures: u32,
    pub last_event_ms_ago: Option<u64>,
}

/// Listener-hot liveness state, shared with the realtime listener task.
struct Liveness {
    last_event_at_ms: AtomicU64,
    realtime_failures: AtomicU32,
}

pub struct DeviceSession {
    config: BridgeConfig,
    pipeline: Pipeline,
    bus: EventBus,
    shutdown: CancellationToken,

    driver: tokio::sync::RwLock<Option<Arc<dyn DeviceDriver>>>,
    /// Serializes every driver call outside the realtime delivery path.
    op_lock: tokio::sync::Mutex<()>,
    /// Serializes connect attempts (session singleton).
    connect_lock: tokio::sync::Mutex<()>,

    state: parking_lot::Mutex<SessionState>,
    device_ip: parking_lot::Mutex<Option<String>>,
    breaker: CircuitBreaker,

    live: Arc<Liveness>,
    permanent_polling: AtomicBool,
    manual_polling: AtomicBool,

    poll_baseline: AtomicUsize,
    baseline_set: AtomicBool,
}

impl DeviceSession {
    pub fn new(
        config: BridgeConfig,
        pipeline: Pipeline,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pipeline,
            bus,
            shutdown,
            driver: tokio::sync::RwLock::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            connect_lock: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(SessionState::Idle),
            device_ip: parking_lot::Mutex::new(None),
            breaker: CircuitBreaker::device_connect(),
            live: Arc::new(Liveness {
                last_event_at_ms: AtomicU64::new(0),
                realtime_failures: AtomicU32::new(0),
            }),
            permanent_polling: AtomicBool::new(false),
            manual_polling: AtomicBool::new(false),
            poll_baseline: AtomicUsize::new(0),
            baseline_set: AtomicBool::new(false),
        })
    }

    // -- State ----------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(prev = state.as_str(), next = next.as_str(), "session state");
            *state = next;
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state(), SessionState::Idle | SessionState::Connecting)
    }

    pub fn device_ip(&self) -> Option<String> {
        self.device_ip.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        let last = self.live.last_event_at_ms.load(Ordering::Relaxed);
        SessionStatus {
            connected: self.is_connected(),
            ip: self.device_ip(),
            port: self.config.device_port,
            mock: self.config.use_mock_device,
            state: self.state(),
            permanent_polling: self.permanent_polling.load(Ordering::Relaxed),
            realtime_failures: self.live.realtime_failures.load(Ordering::Relaxed),
            last_event_ms_ago: if last == 0 { None } else { Some(epoch_ms().saturating_sub(last)) },
        }
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    fn publish_status(&self) {
        let status = self.status();
        self.bus.publish(BusEvent::DeviceStatus {
            connected: status.connected,
            ip: status.ip,
            port: status.port,
            mode: status.state.as_str().to_owned(),
        });
    }

    // -- Connect --------------------------------------------------------------

    /// Connect to a specific address, building the configured driver.
    pub async fn connect_to(&self, ip: &str) -> anyhow::Result<()> {
        let driver = device::build_driver(&self.config, ip);
        self.connect_with_driver(ip, driver).await
    }

    /// Connect with an explicit driver instance.
    pub async fn connect_with_driver(
        &self,
        ip: &str,
        driver: Arc<dyn DeviceDriver>,
    ) -> anyhow::Result<()> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        self.bus
            .publish(BusEvent::Connecting { ip: ip.to_owned(), port: self.config.device_port });

        let connect_driver = Arc::clone(&driver);
        let result = retry(RetryPolicy::device_connect(), &self.breaker, || {
            let driver = Arc::clone(&connect_driver);
            async move { driver.connect().await }
        })
        .await;

        if let Err(e) = result {
            self.set_state(SessionState::Idle);
            self.bus.publish(BusEvent::ConnectionFailed {
                ip: ip.to_owned(),
                error: format!("{e:#}"),
                suggestions: vec![
                    "Confirm the terminal answers on TCP 4370".to_owned(),
                    "Run a scan to re-discover the device address".to_owned(),
                ],
            });
            self.publish_status();
            return Err(e);
        }

        self.set_state(SessionState::Enabled);
        *self.device_ip.lock() = Some(ip.to_owned());

        // Optional connect-time calls: bounded, logged, never fatal.
        let info = tokio::time::timeout(OPTIONAL_CALL_TIMEOUT, driver.get_info()).await;
        match info {
            Ok(Ok(info)) => tracing::info!(name = %info.name, serial = ?info.serial, "device identified"),
            Ok(Err(e)) => tracing::warn!(err = %e, "device info fetch failed"),
            Err(_) => tracing::warn!("device info fetch timed out"),
        }

        let realtime_ok =
            match tokio::time::timeout(OPTIONAL_CALL_TIMEOUT, driver.enable_realtime()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(err = %e, "realtime enable failed");
                    false
                }
                Err(_) => {
                    tracing::warn!("realtime enable timed out");
                    false
                }
            };

        // Attach the listener before exposing the driver.
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        driver.on_event(tx);
        self.spawn_listener(ip.to_owned(), rx);

        *self.driver.write().await = Some(driver);

        // Fresh connection: liveness clock restarts and the polling baseline
        // must be re-established on the next pull.
        self.live.last_event_at_ms.store(epoch_ms(), Ordering::Relaxed);
        self.live.realtime_failures.store(0, Ordering::Relaxed);
        self.baseline_set.store(false, Ordering::Relaxed);

        self.set_state(if realtime_ok { SessionState::Realtime } else { SessionState::Degraded });
        self.bus.publish(BusEvent::DeviceConnected {
            ip: ip.to_owned(),
            port: self.config.device_port,
        });
        self.publish_status();
        Ok(())
    }

    /// Tear the session down; converges to `Idle` even when the driver hangs.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Disconnecting);
        let driver = self.driver.write().await.take();
        if let Some(driver) = driver {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, driver.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(err = %e, "graceful disconnect failed"),
                Err(_) => tracing::warn!("disconnect timed out, dropping socket"),
            }
        }
        self.set_state(SessionState::Idle);
        self.publish_status();
    }

    /// Disconnect and connect again to the last known address.
    pub async fn reconnect(&self) -> anyhow::Result<()> {
        let ip = self.device_ip().ok_or_else(|| anyhow::anyhow!("no device address known"))?;
        self.disconnect().await;
        self.connect_to(&ip).await
    }

    // -- Realtime listener ----------------------------------------------------

    fn spawn_listener(&self, device_id: String, mut rx: mpsc::Receiver<device::RawDeviceEvent>) {
        let live = Arc::clone(&self.live);
        let pipeline = self.pipeline.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };

                // Any frame proves the realtime path is alive.
                live.last_event_at_ms.store(epoch_ms(), Ordering::Relaxed);
                live.realtime_failures.store(0, Ordering::Relaxed);

                // Hand off immediately; ingest is O(1) and never blocks the
                // delivery path.
                pipeline.ingest(RawPunch {
                    biometric_id: event.biometric_id.unwrap_or_else(|| "0".to_owned()),
                    instant: event.instant,
                    device_id: device_id.clone(),
                    source: PunchSource::Realtime,
                });
            }
            tracing::debug!("realtime listener stopped");
        });
    }

    // -- Polling --------------------------------------------------------------

    /// One smart-poll tick. Does nothing while realtime is healthy; counts
    /// observed timeouts toward the permanent-polling latch otherwise, then
    /// pulls the log and emits only the suffix beyond the last baseline.
    pub async fn smart_poll(&self) {
        if !self.is_connected() {
            return;
        }

        let permanent = self.permanent_polling.load(Ordering::Relaxed);
        let manual = self.manual_polling.load(Ordering::Relaxed);
        let last = self.live.last_event_at_ms.load(Ordering::Relaxed);
        let quiet = epoch_ms().saturating_sub(last) >= REALTIME_TIMEOUT.as_millis() as u64;
        let failures = self.live.realtime_failures.load(Ordering::Relaxed);

        if !permanent && !manual && !quiet && failures < MAX_REALTIME_FAILURES {
            return;
        }

        if quiet && !permanent {
            let count = self.live.realtime_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(count, "realtime quiet past timeout");
            if count >= MAX_REALTIME_FAILURES {
                self.permanent_polling.store(true, Ordering::Relaxed);
                tracing::warn!("latching permanent polling mode");
            }
        }

        if self.permanent_polling.load(Ordering::Relaxed) {
            self.set_state(SessionState::Polling);
        } else if matches!(self.state(), SessionState::Realtime) {
            self.set_state(SessionState::Both);
        }

        match self.pull_log().await {
            Ok(entries) => self.emit_poll_delta(entries),
            Err(e) => {
                tracing::warn!(err = %e, "poll failed");
                if crate::policy::is_retryable(&e) {
                    // Transport fault: drop the session and let the watchdog
                    // bring it back.
                    self.disconnect().await;
                }
            }
        }
    }

    /// Emit entries beyond the last observed log length. The first pull after
    /// a (re)connect only records the baseline.
    fn emit_poll_delta(&self, entries: Vec<LogEntry>) {
        let len = entries.len();
        if !self.baseline_set.swap(true, Ordering::Relaxed) {
            self.poll_baseline.store(len, Ordering::Relaxed);
            tracing::info!(baseline = len, "poll baseline established");
            return;
        }

        let baseline = self.poll_baseline.swap(len, Ordering::Relaxed);
        if len <= baseline {
            return;
        }
        let device_id = self.device_ip().unwrap_or_else(|| "device".to_owned());
        for entry in entries.into_iter().skip(baseline) {
            self.pipeline.ingest(RawPunch {
                biometric_id: entry.biometric_id,
                instant: Some(entry.instant),
                device_id: device_id.clone(),
                source: PunchSource::Poll,
            });
        }
    }

    /// Manual polling control (`POST /polling/start|stop`).
    pub fn set_manual_polling(&self, enabled: bool) {
        self.manual_polling.store(enabled, Ordering::Relaxed);
    }

    // -- Serialized driver operations ----------------------------------------

    async fn current_driver(&self) -> anyhow::Result<Arc<dyn DeviceDriver>> {
        self.driver
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("device not connected"))
    }

    pub async fn get_info(&self) -> anyhow::Result<DeviceInfo> {
        let driver = self.current_driver().await?;
        let _op = self.op_lock.lock().await;
        driver.get_info().await
    }

    pub async fn pull_log(&self) -> anyhow::Result<Vec<LogEntry>> {
        let driver = self.current_driver().await?;
        let _op = self.op_lock.lock().await;
        driver.pull_log().await
    }

    pub async fn set_user(&self, user: &NewDeviceUser) -> anyhow::Result<()> {
        let driver = self.current_driver().await?;
        let _op = self.op_lock.lock().await;
        driver.set_user(user).await
    }

    pub async fn delete_user(&self, biometric_id: &str) -> anyhow::Result<()> {
        let driver = self.current_driver().await?;
        let _op = self.op_lock.lock().await;
        driver.delete_user(biometric_id).await
    }

    pub async fn get_users(&self) -> anyhow::Result<Vec<DeviceUser>> {
        let driver = self.current_driver().await?;
        let _op = self.op_lock.lock().await;
        driver.get_users().await
    }
}

// -- Background loops ---------------------------------------------------------

/// Start the polling tick and the reconnect watchdog.
pub fn spawn_loops(session: Arc<DeviceSession>) {
    {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(session.config.poll_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = session.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                session.smart_poll().await;
            }
        });
    }

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(WATCHDOG_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = session.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            // Verify the socket is live; schedule a reconnect otherwise. The
            // breaker inside connect keeps this from storming a dead device.
            let live = match *session.driver.read().await {
                Some(ref driver) => driver.is_connected(),
                None => false,
            };
            if live {
                continue;
            }
            let Some(ip) = session.device_ip() else { continue };
            tracing::info!(ip = %ip, "watchdog reconnecting");
            session.disconnect().await;
            if let Err(e) = session.connect_to(&ip).await {
                tracing::warn!(err = %e, "watchdog reconnect failed");
            }
        }
    });
}

/// Startup connector: direct connect when an address is known, otherwise a
/// bounded discovery retry loop.
pub fn spawn_auto_connect(session: Arc<DeviceSession>, scanner: Arc<Scanner>) {
    tokio::spawn(async move {
        if session.config.use_mock_device {
            if let Err(e) = session.connect_to("mock").await {
                tracing::error!(err = %e, "mock device connect failed");
            }
            return;
        }

        if let Some(ip) = session.config.ip.clone() {
            if let Err(e) = session.connect_to(&ip).await {
                tracing::warn!(ip = %ip, err = %e, "configured device unreachable");
            }
            return;
        }

        if !session.config.auto_discover_device {
            tracing::info!("no device address configured and auto-discovery disabled");
            return;
        }

        for attempt in 0..session.config.auto_discovery_retries {
            if session.shutdown.is_cancelled() {
                return;
            }
            match scanner.find_first().await {
                Some(ip) => {
                    match session.connect_to(&ip).await {
                        Ok(()) => return,
                        Err(e) => tracing::warn!(ip = %ip, err = %e, "discovered device refused"),
                    }
                }
                None => {
                    tracing::info!(attempt, "discovery found no device");
                }
            }
            tokio::time::sleep(session.config.auto_discovery_retry_delay()).await;
        }
        tracing::warn!("auto-discovery exhausted its retries");
    });
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
