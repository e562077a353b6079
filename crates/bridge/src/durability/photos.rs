// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk profile photo storage (the offload target for the user cache).

use base64::Engine as _;

use crate::paths::DataLayout;

pub struct PhotoStore {
    layout: DataLayout,
}

impl PhotoStore {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Decode base64 image bytes and store them as `{user_id}.jpg`; returns
    /// the offline-dir-relative path.
    pub fn save_user_photo(&self, user_id: &str, b64: &str) -> anyhow::Result<String> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64.trim())?;
        let file = self.layout.photos_dir.join(format!("{user_id}.jpg"));
        std::fs::write(&file, bytes)?;
        Ok(format!("photos/{user_id}.jpg"))
    }

    /// Read a stored photo back as base64. `path` is the relative path
    /// returned by [`save_user_photo`]; absolute paths and traversal are
    /// rejected.
    pub fn read_user_photo(&self, path: &str) -> anyhow::Result<String> {
        if path.contains("..") || path.starts_with('/') {
            anyhow::bail!("invalid photo path {path:?}");
        }
        let file = self.layout.offline_dir.join(path);
        let bytes = std::fs::read(&file)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}
