//! Cleanup scheduler
//!
//! Enforces three caps (item count, inline bytes, external bytes) by
//! deleting the oldest unpinned items. Planning runs on the search read
//! connection; the deletion itself is one writer transaction; blob
//! reclamation fans out on a bounded worker pool so reclaiming thousands of
//! files never bursts the disk.
//!
//! The orphan sweep (content files no live row references) runs deferred at
//! startup and at most once per hour after that. It refuses to run when the
//! store root disagrees with the configured root - the guard that keeps a
//! misconfigured test environment from deleting real data.

use crate::config::{DataPaths, Settings};
use crate::error::Result;
use crate::filestore::FileStore;
use crate::search::SearchEngine;
use crate::store::{StoreReader, StoreWriter};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Concurrent blob deletions, regardless of list size.
const MAX_CONCURRENT_RECLAIMS: usize = 8;

/// Minimum spacing between orphan sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Row ids chosen for deletion by the planner.
#[derive(Debug, Default)]
pub struct CleanupPlan {
    pub row_ids: Vec<i64>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }
}

/// What a cleanup run did.
#[derive(Debug, Default, serde::Serialize)]
pub struct CleanupReport {
    pub deleted_items: usize,
    pub reclaimed_blobs: usize,
    pub swept_orphans: usize,
}

/// Decide which rows to delete. Runs on the reader connection; never
/// mutates anything.
pub fn plan_deletions(reader: &StoreReader, settings: &Settings) -> Result<CleanupPlan> {
    let stats = reader.statistics()?;
    let conn = reader.connection();
    let mut doomed: BTreeSet<i64> = BTreeSet::new();

    // Cap 1: item count. Oldest unpinned first.
    if stats.item_count > settings.max_items {
        let overflow = (stats.item_count - settings.max_items) as i64;
        let mut stmt = conn.prepare_cached(
            "SELECT row_id FROM items WHERE is_pinned = 0
             ORDER BY last_used_at ASC, row_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([overflow], |row| row.get::<_, i64>(0))?;
        for row in rows {
            doomed.insert(row?);
        }
    }

    // Cap 2: inline bytes. Walk oldest unpinned inline items until the sum
    // would fit.
    if stats.inline_bytes > settings.max_inline_size_bytes {
        let mut excess = (stats.inline_bytes - settings.max_inline_size_bytes) as i64;
        let mut stmt = conn.prepare_cached(
            "SELECT row_id, size_bytes FROM items
             WHERE is_pinned = 0 AND storage_ref IS NULL
             ORDER BY last_used_at ASC, row_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            if excess <= 0 {
                break;
            }
            let (row_id, size) = row?;
            if doomed.insert(row_id) {
                excess -= size;
            }
        }
    }

    // Cap 3: external bytes, same walk over externalized items.
    if stats.external_bytes > settings.max_external_size_bytes {
        let mut excess = (stats.external_bytes - settings.max_external_size_bytes) as i64;
        let mut stmt = conn.prepare_cached(
            "SELECT row_id, size_bytes FROM items
             WHERE is_pinned = 0 AND storage_ref IS NOT NULL
             ORDER BY last_used_at ASC, row_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            if excess <= 0 {
                break;
            }
            let (row_id, size) = row?;
            if doomed.insert(row_id) {
                excess -= size;
            }
        }
    }

    Ok(CleanupPlan {
        row_ids: doomed.into_iter().collect(),
    })
}

/// Delete a list of blobs with bounded concurrency.
pub async fn reclaim_blobs(files: Arc<FileStore>, refs: Vec<PathBuf>) -> usize {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_RECLAIMS));
    let mut handles = Vec::with_capacity(refs.len());

    for path in refs {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let files = files.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            files.delete_blob(&path);
            drop(permit);
        }));
    }

    let mut reclaimed = 0;
    for handle in handles {
        if handle.await.is_ok() {
            reclaimed += 1;
        }
    }
    reclaimed
}

pub struct CleanupScheduler {
    writer: Arc<StoreWriter>,
    engine: Arc<SearchEngine>,
    files: Arc<FileStore>,
    paths: DataPaths,
    last_sweep: Mutex<Option<Instant>>,
}

impl CleanupScheduler {
    pub fn new(
        writer: Arc<StoreWriter>,
        engine: Arc<SearchEngine>,
        files: Arc<FileStore>,
        paths: DataPaths,
    ) -> Self {
        Self {
            writer,
            engine,
            files,
            paths,
            last_sweep: Mutex::new(None),
        }
    }

    /// Enforce the caps: plan on the reader, delete on the writer, reclaim
    /// blobs on the bounded pool, then drop the engine's caches.
    pub async fn run(&self, settings: &Settings) -> Result<CleanupReport> {
        let plan = self.engine.plan_cleanup(settings.clone()).await?;
        if plan.is_empty() {
            return Ok(CleanupReport::default());
        }

        let execution = self.writer.execute_cleanup(plan.row_ids).await?;
        tracing::info!(deleted = execution.deleted, "cleanup removed items");

        for id in &execution.deleted_ids {
            self.files.delete_thumbnail(id);
        }
        let reclaimed = reclaim_blobs(self.files.clone(), execution.reclaim).await;

        self.engine.invalidate_caches().await?;

        Ok(CleanupReport {
            deleted_items: execution.deleted,
            reclaimed_blobs: reclaimed,
            swept_orphans: 0,
        })
    }

    /// Reclaim content files no live row references. `force` skips the
    /// hourly limiter (tests, explicit CLI runs).
    pub async fn orphan_sweep(&self, force: bool) -> Result<usize> {
        {
            let mut last = self.last_sweep.lock().unwrap();
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < SWEEP_INTERVAL {
                        return Ok(0);
                    }
                }
            }
            *last = Some(Instant::now());
        }

        // Safety check: never sweep a directory that is not our own store.
        if !self.paths.db_path().exists()
            || !self.files.content_dir().starts_with(self.paths.root())
        {
            tracing::warn!("orphan sweep refused: store root mismatch");
            return Ok(0);
        }

        let referenced = self.engine.storage_refs().await?;
        let on_disk = self.files.list_content()?;
        let orphans: Vec<PathBuf> = on_disk
            .into_iter()
            .filter(|path| !referenced.contains(path))
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = orphans.len(), "orphan sweep reclaiming blobs");
        let swept = reclaim_blobs(self.files.clone(), orphans).await;
        Ok(swept)
    }
}
