// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the local API.

pub mod auth;
pub mod http;
pub mod rate_limit;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::state::BridgeState;
use self::rate_limit::RateLimiter;

/// Build the axum `Router` with all bridge routes.
pub fn build_router(state: Arc<BridgeState>) -> Router {
    let limiter = Arc::new(RateLimiter::new());
    let static_dir = ServeDir::new(state.layout.offline_dir.clone());

    Router::new()
        // Liveness
        .route("/health", get(http::health))
        .route("/status", get(http::status))
        // Device session
        .route("/reconnect", get(http::reconnect))
        .route("/device/info", get(http::device_info))
        .route("/device/scan", get(http::device_scan))
        .route("/device/connect", post(http::device_connect))
        // Attendance & polling
        .route("/attendance/logs", get(http::attendance_logs))
        .route("/polling/start", post(http::polling_start))
        .route("/polling/stop", post(http::polling_stop))
        // Device user table
        .route("/users", get(http::list_users))
        .route("/users/add", post(http::add_user))
        .route("/users/{user_id}", delete(http::delete_user))
        // Sync
        .route("/sync/status", get(http::sync_status))
        .route("/sync/force", post(http::sync_force))
        // Stats
        .route("/stats/cache", get(http::stats_cache))
        .route("/stats/queue", get(http::stats_queue))
        .route("/stats/batcher", get(http::stats_batcher))
        .route("/stats/breaker", get(http::stats_breaker))
        .route("/stats/sync", get(http::stats_sync))
        .route("/stats/enrollment", get(http::stats_enrollment))
        // Push bus
        .route("/ws", get(ws::ws_handler))
        // Offloaded photos
        .nest_service("/static", static_dir)
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(middleware::from_fn_with_state(limiter, rate_limit::rate_limit_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod http_tests;
