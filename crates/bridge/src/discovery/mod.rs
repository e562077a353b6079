// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! LAN discovery: find listening terminals by sweeping candidate /24 ranges
//! with concurrent TCP connect probes.
//!
//! The sweep never fails — any internal error degrades to an empty result —
//! and it is bounded three ways: a fixed worker pool drains a shared cursor,
//! an early-exit flag trips once enough devices are found, and the whole
//! sweep runs under a total time budget.

pub mod arp;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::device::{zk::ZkDriver, DeviceDriver, DeviceInfo};
use crate::events::{BusEvent, EventBus};

/// Stop sweeping once this many hosts have answered.
const MAX_DEVICES: usize = 5;
/// Hard cap on the identity fetch per discovered host.
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(3);
/// Total sweep budget.
const SCAN_BUDGET: Duration = Duration::from_secs(40);
/// Per-host probe timeout when the operator has not configured one.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(400);
/// Worker count when the operator has not configured one.
const DEFAULT_WORKERS: usize = 150;

/// Hints published alongside a failed or empty scan.
fn suggestions() -> Vec<String> {
    vec![
        "Check the terminal is powered on and connected to the same LAN".to_owned(),
        "Verify TCP port 4370 is not blocked by a firewall".to_owned(),
        "Set a static device IP in settings if your network uses an unusual range".to_owned(),
    ]
}

pub struct Scanner {
    port: u16,
    probe_timeout: Duration,
    workers: usize,
    bus: EventBus,
}

impl Scanner {
    pub fn new(port: u16, probe_timeout: Duration, workers: usize, bus: EventBus) -> Self {
        let workers = workers.max(1);
        Self { port, probe_timeout, workers, bus }
    }

    pub fn with_defaults(bus: EventBus) -> Self {
        Self::new(4370, DEFAULT_PROBE_TIMEOUT, DEFAULT_WORKERS, bus)
    }

    /// Sweep the LAN and return every discovered terminal with whatever
    /// metadata could be fetched. Never errors.
    pub async fn scan(&self) -> Vec<DeviceInfo> {
        let locals = local_ipv4_addrs();
        let prefixes = candidate_prefixes(&locals);
        self.bus.publish(BusEvent::ScanStarted { prefixes: prefixes.clone() });

        let hosts = sweep_order(&prefixes, &locals);
        tracing::info!(
            prefixes = prefixes.len(),
            hosts = hosts.len(),
            workers = self.workers,
            "discovery sweep starting"
        );

        let open = match tokio::time::timeout(SCAN_BUDGET, self.probe_hosts(hosts)).await {
            Ok(open) => open,
            Err(_) => {
                tracing::warn!(budget_secs = SCAN_BUDGET.as_secs(), "discovery budget exhausted");
                Vec::new()
            }
        };

        if open.is_empty() {
            self.bus.publish(BusEvent::DeviceNotFound { suggestions: suggestions() });
            return Vec::new();
        }

        let macs = arp::table();
        let mut devices = Vec::with_capacity(open.len());
        for ip in open {
            let mut info = self.fetch_info(&ip).await;
            if info.mac.is_none() {
                info.mac = macs.get(&ip).cloned();
            }
            self.bus.publish(BusEvent::DeviceDiscovered { device: info.clone() });
            devices.push(info);
        }
        devices
    }

    /// Convenience: first discovered address, if any.
    pub async fn find_first(&self) -> Option<String> {
        self.scan().await.first().map(|d| d.ip.clone())
    }

    /// Probe `hosts` in order with the worker pool; returns hosts that
    /// accepted a TCP connect, in discovery order.
    pub(crate) async fn probe_hosts(&self, hosts: Vec<String>) -> Vec<String> {
        let hosts = Arc::new(hosts);
        let cursor = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let found: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let hosts = Arc::clone(&hosts);
            let cursor = Arc::clone(&cursor);
            let stop = Arc::clone(&stop);
            let found = Arc::clone(&found);
            let port = self.port;
            let timeout = self.probe_timeout;

            handles.push(tokio::spawn(async move {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(host) = hosts.get(idx) else { break };

                    let attempt =
                        tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
                            .await;
                    if let Ok(Ok(stream)) = attempt {
                        // "Open" is connect-then-close; no payload is sent.
                        drop(stream);
                        let mut found = found.lock();
                        found.push(host.clone());
                        if found.len() >= MAX_DEVICES {
                            stop.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let found = found.lock().clone();
        found
    }

    /// Short-lived session for the identity fetch; a timeout downgrades to a
    /// placeholder rather than dropping the host.
    async fn fetch_info(&self, ip: &str) -> DeviceInfo {
        let driver = ZkDriver::new(ip.to_owned(), self.port, INFO_FETCH_TIMEOUT, INFO_FETCH_TIMEOUT);
        let fetched = tokio::time::timeout(INFO_FETCH_TIMEOUT, async {
            driver.connect().await?;
            driver.get_info().await
        })
        .await;
        let _ = driver.disconnect().await;

        match fetched {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::debug!(ip, err = %e, "identity fetch failed");
                DeviceInfo::placeholder(ip, self.port)
            }
            Err(_) => {
                tracing::debug!(ip, "identity fetch timed out");
                DeviceInfo::placeholder(ip, self.port)
            }
        }
    }
}

// -- Host enumeration ---------------------------------------------------------

/// Non-internal, non-link-local IPv4 addresses of this machine.
fn local_ipv4_addrs() -> Vec<std::net::Ipv4Addr> {
    let Ok(ifaces) = if_addrs::get_if_addrs() else { return Vec::new() };
    ifaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) if !v4.is_link_local() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .collect()
}

/// Candidate /24 prefixes: every local subnet plus the common home ranges,
/// deduplicated in that order.
pub(crate) fn candidate_prefixes(locals: &[std::net::Ipv4Addr]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let defaults = ["192.168.0.", "192.168.1.", "192.168.2."];
    for prefix in locals
        .iter()
        .map(|ip| {
            let o = ip.octets();
            format!("{}.{}.{}.", o[0], o[1], o[2])
        })
        .chain(defaults.iter().map(|s| (*s).to_owned()))
    {
        if seen.insert(prefix.clone()) {
            out.push(prefix);
        }
    }
    out
}

/// Hosts to probe, in sweep order.
///
/// Within each prefix, devices are usually DHCP'd into the upper half, so
/// [100..=200] goes first, then [2..=99] and [201..=254]. The gateway (1),
/// broadcast (255), and this machine are skipped.
pub(crate) fn sweep_order(prefixes: &[String], locals: &[std::net::Ipv4Addr]) -> Vec<String> {
    let local_set: HashSet<String> = locals.iter().map(|ip| ip.to_string()).collect();
    let mut hosts = Vec::new();
    for prefix in prefixes {
        for octet in (100..=200).chain(2..=99).chain(201..=254) {
            let ip = format!("{prefix}{octet}");
            if !local_set.contains(&ip) {
                hosts.push(ip);
            }
        }
    }
    hosts
}
