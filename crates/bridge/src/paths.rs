// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! App-data directory layout.
//!
//! Everything the bridge persists lives under one per-OS application data
//! root, subdirectory `ZK-Attendance/`:
//!
//! ```text
//! user-settings.json                   connection preferences
//! offline-data/pending-attendance.json active spill (NDJSON)
//! offline-data/pending-attendance.json.<ts>  rotated spill batches
//! offline-data/users-cache.json        offline mirror of the user cache
//! offline-data/photos/<user>.jpg       offloaded profile photos
//! database/                            reserved for an optional mirror
//! ```

use std::path::{Path, PathBuf};

/// Application subdirectory under the OS data root.
const APP_DIR: &str = "ZK-Attendance";

/// Resolved filesystem layout for all persisted state.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub offline_dir: PathBuf,
    pub photos_dir: PathBuf,
    pub spill_path: PathBuf,
    pub users_cache_path: PathBuf,
    pub settings_path: PathBuf,
}

impl DataLayout {
    /// Build the layout rooted at `root` (no directories are created).
    pub fn at(root: PathBuf) -> Self {
        let offline_dir = root.join("offline-data");
        Self {
            photos_dir: offline_dir.join("photos"),
            spill_path: offline_dir.join("pending-attendance.json"),
            users_cache_path: offline_dir.join("users-cache.json"),
            settings_path: root.join("user-settings.json"),
            offline_dir,
            root,
        }
    }

    /// Build the layout under the OS-conventional data root, or under
    /// `override_dir` when the operator supplied one.
    pub fn resolve(override_dir: Option<&Path>) -> Self {
        let root = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => os_data_root().join(APP_DIR),
        };
        Self::at(root)
    }

    /// Create every directory the bridge writes into.
    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.photos_dir)?;
        std::fs::create_dir_all(self.root.join("database"))?;
        Ok(())
    }
}

/// Per-OS application data root.
fn os_data_root() -> PathBuf {
    #[cfg(target_os = "windows")]
    return std::env::var("APPDATA").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));

    #[cfg(target_os = "macos")]
    return std::env::var("HOME")
        .map(|home| PathBuf::from(home).join("Library").join("Application Support"))
        .unwrap_or_else(|_| PathBuf::from("."));

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    PathBuf::from("/var/local")
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod paths_tests;
