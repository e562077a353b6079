// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the local API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::device::NewDeviceUser;
use crate::error::ApiError;
use crate::state::BridgeState;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub device_connected: bool,
    pub online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Persist this address as the static device address.
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserRequest {
    pub biometric_id: String,
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub role: Option<u8>,
    #[serde(default)]
    pub card_no: Option<u32>,
}

fn upstream_error(e: anyhow::Error) -> axum::response::Response {
    ApiError::DeviceUnavailable.to_http_response(format!("{e:#}")).into_response()
}

// -- Liveness & device --------------------------------------------------------

/// `GET /health`
pub async fn health(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        device_connected: s.session.is_connected(),
        online: s.durability.is_online(),
    })
}

/// `GET /status` — device connectivity snapshot.
pub async fn status(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.session.status())
}

/// `GET /reconnect` — tear down and re-establish the device session.
pub async fn reconnect(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match s.session.reconnect().await {
        Ok(()) => Json(s.session.status()).into_response(),
        Err(e) => upstream_error(e),
    }
}

/// `GET /device/info`
pub async fn device_info(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match s.session.get_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => upstream_error(e),
    }
}

/// `GET /device/scan` — run discovery now.
pub async fn device_scan(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    let devices = s.scanner.scan().await;
    Json(devices)
}

/// `POST /device/connect` — connect to a specific address, optionally
/// persisting it.
pub async fn device_connect(
    State(s): State<Arc<BridgeState>>,
    Json(req): Json<ConnectRequest>,
) -> impl IntoResponse {
    if req.ip.parse::<std::net::Ipv4Addr>().is_err() {
        return ApiError::BadRequest.to_http_response("ip must be a valid IPv4 address")
            .into_response();
    }

    if req.remember {
        let mut settings = crate::settings::load(&s.layout.settings_path).unwrap_or_default();
        settings.static_ip = Some(req.ip.clone());
        settings.static_port = req.port;
        if let Err(e) = crate::settings::save(&s.layout.settings_path, &settings) {
            tracing::warn!(err = %e, "failed to persist static address");
        }
    }

    s.session.disconnect().await;
    match s.session.connect_to(&req.ip).await {
        Ok(()) => Json(s.session.status()).into_response(),
        Err(e) => upstream_error(e),
    }
}

// -- Attendance & polling -----------------------------------------------------

/// `GET /attendance/logs` — raw passthrough to the device log.
pub async fn attendance_logs(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match s.session.pull_log().await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => upstream_error(e),
    }
}

/// `POST /polling/start`
pub async fn polling_start(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    s.session.set_manual_polling(true);
    Json(OkResponse { ok: true })
}

/// `POST /polling/stop`
pub async fn polling_stop(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    s.session.set_manual_polling(false);
    Json(OkResponse { ok: true })
}

// -- Device user table --------------------------------------------------------

/// `GET /users` — list users from the device.
pub async fn list_users(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match s.session.get_users().await {
        Ok(users) => Json(users).into_response(),
        Err(e) => upstream_error(e),
    }
}

/// `POST /users/add`
pub async fn add_user(
    State(s): State<Arc<BridgeState>>,
    Json(req): Json<AddUserRequest>,
) -> impl IntoResponse {
    let mut user = match NewDeviceUser::for_enrollment(&req.biometric_id, &req.name) {
        Ok(user) => user,
        Err(e) => {
            return ApiError::BadRequest.to_http_response(format!("{e:#}")).into_response()
        }
    };
    user.password = req.password.unwrap_or_default();
    user.role = req.role.unwrap_or(0);
    user.card_no = req.card_no.unwrap_or(0);

    match s.session.set_user(&user).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => upstream_error(e),
    }
}

/// `DELETE /users/{user_id}`
pub async fn delete_user(
    State(s): State<Arc<BridgeState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match s.session.delete_user(&user_id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => upstream_error(e),
    }
}

// -- Sync ---------------------------------------------------------------------

/// `GET /sync/status`
pub async fn sync_status(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.sync.status())
}

/// `POST /sync/force` — manual drain.
pub async fn sync_force(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match s.sync.force_sync_now().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => ApiError::StoreError.to_http_response(format!("{e:#}")).into_response(),
    }
}

// -- Stats --------------------------------------------------------------------

/// `GET /stats/cache`
pub async fn stats_cache(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.cache.stats())
}

/// `GET /stats/queue`
pub async fn stats_queue(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.pipeline.stats())
}

/// `GET /stats/batcher`
pub async fn stats_batcher(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.durability.batcher.stats())
}

/// `GET /stats/breaker`
pub async fn stats_breaker(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.session.breaker_stats())
}

/// `GET /stats/sync`
pub async fn stats_sync(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(s.sync.status())
}

/// `GET /stats/enrollment`
pub async fn stats_enrollment(State(s): State<Arc<BridgeState>>) -> impl IntoResponse {
    match &s.enrollment {
        Some(consumer) => Json(consumer.stats()).into_response(),
        None => ApiError::NotFound.to_http_response("enrollment feed not configured")
            .into_response(),
    }
}
