// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fixed-window rate limiting for the local API.
//!
//! Three tiers: strict for device-touching operations (they serialize
//! through the session lock and are expensive on the wire), loose for cheap
//! read-only endpoints, default for everything else. The surface binds to
//! localhost for a single operator, so windows are per-tier rather than
//! per-client.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;

use crate::clock::epoch_ms;
use crate::error::ApiError;

const WINDOW_MS: u64 = 60_000;

/// Request budget tiers, per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Default,
    Strict,
    Loose,
}

impl Tier {
    pub fn limit(&self) -> u32 {
        match self {
            Self::Default => 60,
            Self::Strict => 10,
            Self::Loose => 120,
        }
    }
}

/// Tier for a request path.
pub fn tier_for(method: &axum::http::Method, path: &str) -> Tier {
    match (method.as_str(), path) {
        ("GET", "/health") | ("GET", "/status") => Tier::Loose,
        _ if path.starts_with("/static/") || path.starts_with("/ws") => Tier::Loose,
        ("GET", "/reconnect")
        | ("GET", "/device/scan")
        | ("GET", "/attendance/logs")
        | ("POST", "/users/add") => Tier::Strict,
        ("DELETE", _) if path.starts_with("/users/") => Tier::Strict,
        _ => Tier::Default,
    }
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<Tier, (u64, u32)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the tier; `false` means over budget.
    pub fn check(&self, tier: Tier) -> bool {
        let now = epoch_ms();
        let window = now - now % WINDOW_MS;
        let mut windows = self.windows.lock();
        let entry = windows.entry(tier).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        if entry.1 >= tier.limit() {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Axum middleware enforcing the tier budgets.
pub async fn rate_limit_layer(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let tier = tier_for(req.method(), req.uri().path());
    if !limiter.check(tier) {
        return ApiError::RateLimited
            .to_http_response("rate limit exceeded, retry shortly")
            .into_response();
    }
    next.run(req).await
}
