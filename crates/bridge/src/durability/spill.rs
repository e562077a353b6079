// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only offline spill: one JSON envelope per LF-terminated line.
//!
//! A single *active* file receives appends; before a drain it is atomically
//! renamed to a timestamped batch file and a fresh active file starts on the
//! next append. Rotated batches are immutable and deleted only after every
//! contained record is either cloud-acknowledged or requeued.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::clock::epoch_ms;
use crate::model::DurableEnvelope;
use crate::paths::DataLayout;

pub struct Spill {
    active_path: PathBuf,
    dir: PathBuf,
    // Serializes appends and rotation against each other.
    write_lock: tokio::sync::Mutex<()>,
}

impl Spill {
    pub fn new(layout: &DataLayout) -> Self {
        Self {
            active_path: layout.spill_path.clone(),
            dir: layout.offline_dir.clone(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// One-time migration: early versions stored the spill as a JSON array.
    /// A leading `[` is converted to line-delimited form (count preserved);
    /// an unreadable file is set aside as `.corrupt.bak` so appends can
    /// continue on a clean slate.
    pub fn migrate_legacy(&self) -> anyhow::Result<usize> {
        let Ok(contents) = std::fs::read_to_string(&self.active_path) else { return Ok(0) };
        if !contents.trim_start().starts_with('[') {
            return Ok(0);
        }

        match serde_json::from_str::<Vec<serde_json::Value>>(&contents) {
            Ok(items) => {
                let mut lines = String::new();
                for item in &items {
                    lines.push_str(&serde_json::to_string(item)?);
                    lines.push('\n');
                }
                let tmp = self.active_path.with_extension("migrate.tmp");
                std::fs::write(&tmp, lines)?;
                std::fs::rename(&tmp, &self.active_path)?;
                tracing::info!(count = items.len(), "migrated legacy spill to line-delimited form");
                Ok(items.len())
            }
            Err(e) => {
                let backup = self.active_path.with_extension("corrupt.bak");
                std::fs::rename(&self.active_path, &backup)?;
                tracing::warn!(err = %e, backup = %backup.display(), "legacy spill unreadable, set aside");
                Ok(0)
            }
        }
    }

    /// Append one envelope. O(1) amortized: a single write syscall.
    pub async fn append(&self, envelope: &DurableEnvelope) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Requeue envelopes into the active segment, idempotent on `record_id`:
    /// records already present are skipped.
    pub async fn requeue(&self, envelopes: &[DurableEnvelope]) -> anyhow::Result<usize> {
        if envelopes.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let existing: HashSet<String> = match tokio::fs::read_to_string(&self.active_path).await {
            Ok(contents) => contents
                .lines()
                .filter_map(|l| parse_line(l).map(|e| e.record_id))
                .collect(),
            Err(_) => HashSet::new(),
        };

        let mut lines = String::new();
        let mut count = 0;
        for envelope in envelopes {
            if existing.contains(&envelope.record_id) {
                continue;
            }
            lines.push_str(&serde_json::to_string(envelope)?);
            lines.push('\n');
            count += 1;
        }
        if count > 0 {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.active_path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(count)
    }

    /// Atomically rename the active file to a timestamped batch, ready for a
    /// drain. `None` when there is nothing to rotate.
    pub async fn rotate(&self) -> anyhow::Result<Option<PathBuf>> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::metadata(&self.active_path).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Ok(None),
        }
        let mut ts = epoch_ms();
        let mut batch = rotated_name(&self.active_path, ts);
        // Same-millisecond rotations must not overwrite an earlier batch.
        while tokio::fs::metadata(&batch).await.is_ok() {
            ts += 1;
            batch = rotated_name(&self.active_path, ts);
        }
        tokio::fs::rename(&self.active_path, &batch).await?;
        Ok(Some(batch))
    }

    /// Rotated batch files, oldest first.
    pub fn batches(&self) -> Vec<PathBuf> {
        let Some(file_name) = self.active_path.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let prefix = format!("{file_name}.");
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return Vec::new() };

        let mut batches: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| {
                        n.strip_prefix(&prefix)
                            .is_some_and(|suffix| suffix.chars().all(|c| c.is_ascii_digit()))
                    })
                    .unwrap_or(false)
            })
            .collect();
        batches.sort();
        batches
    }

    /// Lines pending in the active file plus all rotated batches.
    pub fn pending_count(&self) -> usize {
        let mut count = count_lines(&self.active_path);
        for batch in self.batches() {
            count += count_lines(&batch);
        }
        count
    }

    pub async fn delete_batch(&self, batch: &Path) -> anyhow::Result<()> {
        tokio::fs::remove_file(batch).await?;
        Ok(())
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }
}

/// Parse one spill line; malformed lines yield `None` and are dropped by
/// callers (with a log), never aborting a drain.
pub fn parse_line(line: &str) -> Option<DurableEnvelope> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(err = %e, "dropping malformed spill line");
            None
        }
    }
}

fn rotated_name(active: &Path, ts: u64) -> PathBuf {
    let name = active.file_name().and_then(|n| n.to_str()).unwrap_or("pending-attendance.json");
    active.with_file_name(format!("{name}.{ts}"))
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "spill_tests.rs"]
mod spill_tests;
