// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tally bridge: local middleware between a ZKTeco-family biometric terminal
//! and the cloud attendance backend.
//!
//! One daemon owns the device session, deduplicates and enriches punches,
//! fans them out to UI subscribers, and keeps every accepted punch durable
//! across cloud outages via an append-only local spill.

pub mod cache;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod device;
pub mod discovery;
pub mod durability;
pub mod enroll;
pub mod error;
pub mod events;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod policy;
pub mod session;
pub mod settings;
pub mod state;
pub mod sync;
pub mod transport;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::paths::DataLayout;
use crate::state::BridgeState;

/// Run the bridge until shutdown.
pub async fn run(mut config: BridgeConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    // Fold persisted operator settings into the effective config before any
    // subsystem starts.
    let layout = DataLayout::resolve(config.data_dir.as_deref());
    layout.ensure()?;
    match settings::load(&layout.settings_path) {
        Ok(persisted) => config.apply_settings(&persisted),
        Err(e) => tracing::warn!(err = %e, "user settings unreadable, using defaults"),
    }

    let state = BridgeState::build(config, shutdown.clone())?;

    // Pre-warm the user cache in the background; a cold cache only costs
    // per-punch store lookups.
    {
        let cache = std::sync::Arc::clone(&state.cache);
        tokio::spawn(async move {
            if let Err(e) = cache.prewarm().await {
                tracing::warn!(err = %e, "user cache pre-warm failed");
            }
        });
    }

    // Periodic cache maintenance.
    {
        let cache = std::sync::Arc::clone(&state.cache);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                cache.prune();
            }
        });
    }

    session::spawn_loops(std::sync::Arc::clone(&state.session));
    session::spawn_auto_connect(
        std::sync::Arc::clone(&state.session),
        std::sync::Arc::clone(&state.scanner),
    );
    sync::spawn_sync_worker(std::sync::Arc::clone(&state.sync), shutdown.clone());
    if let Some(ref consumer) = state.enrollment {
        enroll::spawn_consumer(
            std::sync::Arc::clone(consumer),
            state.config.feed_poll_interval(),
            shutdown.clone(),
        );
    }

    // Ctrl-C cancels every owned timer and worker.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let addr = format!("{}:{}", state.config.host, state.config.port);
    tracing::info!("tallyd listening on {addr}");
    let router = transport::build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
