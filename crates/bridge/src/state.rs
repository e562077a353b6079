// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-local core: one value owning every stateful subsystem, passed by
//! reference to HTTP handlers. No module-level singletons.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::UserCache;
use crate::clock::Zone;
use crate::cloud::{memory::MemoryFeed, memory::MemoryStore, rest, DocumentStore, EnrollmentFeed};
use crate::config::BridgeConfig;
use crate::discovery::Scanner;
use crate::durability::Durability;
use crate::enroll::EnrollmentConsumer;
use crate::events::EventBus;
use crate::paths::DataLayout;
use crate::pipeline::Pipeline;
use crate::session::DeviceSession;
use crate::sync::SyncWorker;

pub struct BridgeState {
    pub config: BridgeConfig,
    pub layout: DataLayout,
    pub zone: Zone,
    pub bus: EventBus,
    pub store: Arc<dyn DocumentStore>,
    pub cache: Arc<UserCache>,
    pub durability: Arc<Durability>,
    pub pipeline: Pipeline,
    pub session: Arc<DeviceSession>,
    pub sync: Arc<SyncWorker>,
    pub scanner: Arc<Scanner>,
    pub enrollment: Option<Arc<EnrollmentConsumer>>,
    pub shutdown: CancellationToken,
}

impl BridgeState {
    /// Wire every subsystem (workers included) without binding any sockets.
    pub fn build(config: BridgeConfig, shutdown: CancellationToken) -> anyhow::Result<Arc<Self>> {
        let layout = DataLayout::resolve(config.data_dir.as_deref());
        layout.ensure()?;
        let zone = Zone::new(&config.timezone)?;
        let bus = EventBus::new();

        let store: Arc<dyn DocumentStore> = match config.cloud_base_url.clone() {
            Some(base) => Arc::new(rest::RestStore::new(base, config.cloud_auth_token.clone())),
            None => {
                tracing::warn!("no cloud store configured, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let cache = Arc::new(UserCache::new(
            Arc::clone(&store),
            layout.clone(),
            config.local_base(),
        ));
        let durability =
            Arc::new(Durability::new(Arc::clone(&store), &layout, shutdown.clone()));
        let pipeline = Pipeline::spawn(
            Arc::clone(&cache),
            Arc::clone(&durability),
            bus.clone(),
            zone,
            shutdown.clone(),
        );

        let session =
            DeviceSession::new(config.clone(), pipeline.clone(), bus.clone(), shutdown.clone());
        let sync = SyncWorker::new(
            Arc::clone(&store),
            Arc::clone(&durability),
            bus.clone(),
            config.sync_interval(),
        );
        let scanner = Arc::new(Scanner::new(
            config.device_port,
            config.scan_timeout(),
            config.scan_concurrency,
            bus.clone(),
        ));

        let enrollment = match config.feed_base_url.clone() {
            Some(base) => {
                let feed: Arc<dyn EnrollmentFeed> =
                    Arc::new(rest::RestFeed::new(base, config.cloud_auth_token.clone()));
                Some(EnrollmentConsumer::new(feed, Arc::clone(&session)))
            }
            None if config.use_mock_device => {
                // Dev mode gets an empty in-memory feed so the surface stays
                // exercisable end to end.
                let feed: Arc<dyn EnrollmentFeed> = Arc::new(MemoryFeed::new());
                Some(EnrollmentConsumer::new(feed, Arc::clone(&session)))
            }
            None => None,
        };

        Ok(Arc::new(Self {
            config,
            layout,
            zone,
            bus,
            store,
            cache,
            durability,
            pipeline,
            session,
            sync,
            scanner,
            enrollment,
            shutdown,
        }))
    }
}
