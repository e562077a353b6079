// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User profile cache: TTL + size-bounded map over the cloud `users`
//! collection, with profile photos offloaded to disk.
//!
//! The store may deliver `profileImageUrl` as an inline base64 data URI. On
//! ingest the image is decoded to `offline-data/photos/{id}.jpg` and stripped
//! from the cached entry, so the hot cache stays small regardless of roster
//! size. At read time a `photo_url` pointing at this daemon's `/static`
//! mount is synthesized from the offloaded path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::epoch_ms;
use crate::cloud::DocumentStore;
use crate::model::{MembershipStatus, UserRecord};
use crate::paths::DataLayout;

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);
/// Default size cap.
const DEFAULT_MAX_SIZE: usize = 2000;
/// Upper bound on the pre-warm query.
const PREWARM_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: UserRecord,
    cached_at: u64,
    expires_at: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Offline mirror written at pre-warm time so lookups survive a store
/// outage across restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineUsersFile {
    updated_at: String,
    users: Vec<UserRecord>,
}

pub struct UserCache {
    store: Arc<dyn DocumentStore>,
    layout: DataLayout,
    local_base: String,
    ttl: Duration,
    max_size: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl UserCache {
    pub fn new(store: Arc<dyn DocumentStore>, layout: DataLayout, local_base: String) -> Self {
        Self::with_policy(store, layout, local_base, DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }

    pub fn with_policy(
        store: Arc<dyn DocumentStore>,
        layout: DataLayout,
        local_base: String,
        ttl: Duration,
        max_size: usize,
    ) -> Self {
        Self {
            store,
            layout,
            local_base,
            ttl,
            max_size,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve a biometric id to a user record: cache, then store, then the
    /// offline mirror. `None` means the user genuinely cannot be resolved.
    pub async fn lookup(&self, biometric_id: &str) -> Option<UserRecord> {
        let now = epoch_ms();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(biometric_id) {
                if entry.expires_at > now {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(self.with_photo_url(entry.data.clone()));
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self
            .store
            .query("users", "biometricId", &Value::String(biometric_id.to_owned()), 1)
            .await
        {
            Ok(docs) => {
                let doc = docs.into_iter().next()?;
                let user = self.ingest(&doc)?;
                self.install(user.clone());
                Some(self.with_photo_url(user))
            }
            Err(e) => {
                tracing::warn!(biometric_id, err = %e, "store lookup failed, trying offline mirror");
                self.lookup_offline(biometric_id)
            }
        }
    }

    /// Bulk-load every user with a biometric id, offload photos, and mirror
    /// the result to the offline users file.
    pub async fn prewarm(&self) -> anyhow::Result<usize> {
        let docs = self
            .store
            .query("users", "biometricId", &Value::Null, PREWARM_LIMIT)
            .await
            .map_err(|e| anyhow::anyhow!("prewarm query failed: {e}"))?;

        let mut users = Vec::with_capacity(docs.len());
        for doc in &docs {
            if let Some(user) = self.ingest(doc) {
                users.push(user);
            }
        }
        for user in &users {
            self.install(user.clone());
        }

        let mirror = OfflineUsersFile {
            updated_at: chrono::Utc::now().to_rfc3339(),
            users: users.clone(),
        };
        let json = serde_json::to_string_pretty(&mirror)?;
        let tmp = self.layout.users_cache_path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.layout.users_cache_path)?;

        tracing::info!(count = users.len(), "user cache pre-warmed");
        Ok(users.len())
    }

    /// Read the offline mirror; first match wins.
    pub fn lookup_offline(&self, biometric_id: &str) -> Option<UserRecord> {
        let contents = std::fs::read_to_string(&self.layout.users_cache_path).ok()?;
        let file: OfflineUsersFile = serde_json::from_str(&contents).ok()?;
        file.users
            .into_iter()
            .find(|u| u.biometric_id == biometric_id)
            .map(|u| self.with_photo_url(u))
    }

    /// Install a record with a fresh TTL, evicting if the cap is exceeded.
    pub fn install(&self, user: UserRecord) {
        let now = epoch_ms();
        let mut entries = self.entries.write();
        entries.insert(
            user.biometric_id.clone(),
            CacheEntry { data: user, cached_at: now, expires_at: now + self.ttl.as_millis() as u64 },
        );
        if entries.len() > self.max_size {
            Self::evict_oldest(&mut entries, self.max_size);
        }
    }

    /// Drop expired entries and enforce the size cap.
    pub fn prune(&self) {
        let now = epoch_ms();
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() > self.max_size {
            Self::evict_oldest(&mut entries, self.max_size);
        }
    }

    /// Evict oldest-first (by `cached_at`) down to 80% of the cap, so each
    /// eviction pass buys headroom rather than thrashing at the boundary.
    fn evict_oldest(entries: &mut HashMap<String, CacheEntry>, max_size: usize) {
        let target = max_size.saturating_mul(4) / 5;
        let mut by_age: Vec<(String, u64)> =
            entries.iter().map(|(k, e)| (k.clone(), e.cached_at)).collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age {
            if entries.len() <= target {
                break;
            }
            entries.remove(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let now = epoch_ms();
        let entries = self.entries.read();
        let valid = entries.values().filter(|e| e.expires_at > now).count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: entries.len(),
            valid,
            expired: entries.len() - valid,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    // -- Ingest ---------------------------------------------------------------

    /// Build a cache-ready record from a raw store document, offloading any
    /// inline photo to disk.
    fn ingest(&self, doc: &Value) -> Option<UserRecord> {
        let id = doc.get("id").and_then(|v| v.as_str())?.to_owned();
        let biometric_id = doc.get("biometricId").and_then(|v| v.as_str())?.to_owned();
        let name = doc.get("name").and_then(|v| v.as_str()).unwrap_or("").to_owned();
        let plan_id = doc.get("planId").and_then(|v| v.as_str()).map(String::from);
        let membership_status = doc
            .get("membershipStatus")
            .and_then(|v| serde_json::from_value::<MembershipStatus>(v.clone()).ok())
            .unwrap_or_default();
        let membership_end_date =
            doc.get("membershipEndDate").and_then(|v| v.as_str()).map(String::from);

        let raw_photo = doc
            .get("profileImageUrl")
            .or_else(|| doc.get("photoUrl"))
            .and_then(|v| v.as_str());

        let (photo_path, photo_url) = match raw_photo {
            Some(url) if url.starts_with("data:") => match self.offload_photo(&id, url) {
                Ok(path) => (Some(path), None),
                Err(e) => {
                    tracing::warn!(user_id = %id, err = %e, "photo offload failed");
                    (None, None)
                }
            },
            Some(url) => (None, Some(url.to_owned())),
            None => (None, None),
        };

        Some(UserRecord {
            id,
            biometric_id,
            name,
            photo_path,
            photo_url,
            plan_id,
            membership_status,
            membership_end_date,
        })
    }

    /// Decode a data URI and write it under the photos directory; returns the
    /// layout-relative path.
    fn offload_photo(&self, user_id: &str, data_uri: &str) -> anyhow::Result<String> {
        let encoded = data_uri
            .split_once(',')
            .map(|(_, rest)| rest)
            .ok_or_else(|| anyhow::anyhow!("malformed data URI"))?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        let file = self.layout.photos_dir.join(format!("{user_id}.jpg"));
        std::fs::write(&file, bytes)?;
        Ok(format!("photos/{user_id}.jpg"))
    }

    /// Synthesize a servable URL for offloaded photos.
    fn with_photo_url(&self, mut user: UserRecord) -> UserRecord {
        if user.photo_url.is_none() {
            if let Some(ref path) = user.photo_path {
                user.photo_url = Some(format!("{}/static/{}", self.local_base, path));
            }
        }
        user
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod cache_tests;
