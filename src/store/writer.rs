//! Single-writer repository actor
//!
//! All mutating SQL funnels through one dedicated OS thread that owns the
//! sole writable connection - there is no shared mutable handle anywhere.
//! Async callers talk to it over a bounded channel (FIFO, so concurrent
//! writes serialize in arrival order) and get their result back on a
//! oneshot.
//!
//! Every user-visible write appends its events to the `outbox` table inside
//! the same transaction, bumps `meta.mutation_seq` and maintains the O(1)
//! counters. The outbox is drained to the event bus only after the commit
//! succeeds, and again on startup for rows a crash left behind, which makes
//! delivery at-least-once in commit order.

use super::schema::{meta_add_i64, meta_get_i64};
use super::{ItemSummary, ItemType, NewItem, Stats};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Pending writes allowed before senders wait their turn.
const COMMAND_BUFFER: usize = 64;

/// What `insert_or_update` did.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// A new row was created.
    Inserted(ItemSummary),
    /// An existing row with the same content hash had its timestamp and
    /// use count bumped.
    Updated(ItemSummary),
}

impl WriteOutcome {
    pub fn summary(&self) -> &ItemSummary {
        match self {
            WriteOutcome::Inserted(s) | WriteOutcome::Updated(s) => s,
        }
    }
}

/// Result of a bulk deletion: rows removed, the external refs the caller
/// reclaims off the writer thread, and the ids whose thumbnails go with
/// them.
#[derive(Debug)]
pub struct CleanupExecution {
    pub deleted: usize,
    pub reclaim: Vec<PathBuf>,
    pub deleted_ids: Vec<String>,
}

enum Command {
    InsertOrUpdate {
        item: NewItem,
        reply: oneshot::Sender<Result<WriteOutcome>>,
    },
    TouchByHash {
        content_hash: String,
        used_at: f64,
        reply: oneshot::Sender<Result<Option<ItemSummary>>>,
    },
    UpdateMetadata {
        id: String,
        pinned: Option<bool>,
        touch_used_at: Option<f64>,
        reply: oneshot::Sender<Result<ItemSummary>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<Option<PathBuf>>>,
    },
    DeleteAll {
        keep_pinned: bool,
        reply: oneshot::Sender<Result<CleanupExecution>>,
    },
    ExecuteCleanup {
        row_ids: Vec<i64>,
        reply: oneshot::Sender<Result<CleanupExecution>>,
    },
    Shutdown,
}

/// Handle to the writer thread. Cheap to share behind an `Arc`.
pub struct StoreWriter {
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWriter {
    /// Take ownership of the writable connection and start the writer
    /// thread. Leftover outbox rows from a previous crash are published
    /// before the first command is accepted.
    pub fn spawn(conn: Connection, bus: EventBus) -> Result<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let handle = std::thread::Builder::new()
            .name("clipkeep-writer".into())
            .spawn(move || writer_thread(conn, rx, bus))
            .map_err(|e| Error::Internal(format!("writer thread spawn: {e}")))?;

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Internal("writer thread gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("writer dropped reply".into()))?
    }

    /// Insert a new item or bump the existing row with the same
    /// `content_hash`. Exactly one outbox event is appended either way.
    pub async fn insert_or_update(&self, item: NewItem) -> Result<WriteOutcome> {
        self.send(|reply| Command::InsertOrUpdate { item, reply }).await
    }

    /// Dedup probe + bump in one step: if a row with this hash exists, its
    /// `last_used_at` and `use_count` are updated and the summary returned.
    /// `None` means the caller should persist a new item.
    pub async fn touch_by_hash(
        &self,
        content_hash: &str,
        used_at: f64,
    ) -> Result<Option<ItemSummary>> {
        let content_hash = content_hash.to_string();
        self.send(|reply| Command::TouchByHash {
            content_hash,
            used_at,
            reply,
        })
        .await
    }

    /// Metadata-only update; never touches `plain_text` (and therefore
    /// never rewrites the FTS row).
    pub async fn update_metadata(
        &self,
        id: &str,
        pinned: Option<bool>,
        touch_used_at: Option<f64>,
    ) -> Result<ItemSummary> {
        let id = id.to_string();
        self.send(|reply| Command::UpdateMetadata {
            id,
            pinned,
            touch_used_at,
            reply,
        })
        .await
    }

    /// Remove an item and its FTS row atomically. Returns the external
    /// storage ref (if any) for the caller to delete off this thread.
    pub async fn delete(&self, id: &str) -> Result<Option<PathBuf>> {
        let id = id.to_string();
        self.send(|reply| Command::Delete { id, reply }).await
    }

    /// Batched deletion in one transaction. Returns every external ref the
    /// caller must reclaim.
    pub async fn delete_all(&self, keep_pinned: bool) -> Result<CleanupExecution> {
        self.send(|reply| Command::DeleteAll { keep_pinned, reply })
            .await
    }

    /// Execute a cleanup plan (row ids chosen by the planner) in one
    /// transaction.
    pub async fn execute_cleanup(&self, row_ids: Vec<i64>) -> Result<CleanupExecution> {
        self.send(|reply| Command::ExecuteCleanup { row_ids, reply })
            .await
    }

    /// Stop the thread after the queue drains and join it.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        // Best-effort: `shutdown()` is the real teardown path.
        let _ = self.tx.try_send(Command::Shutdown);
    }
}

fn writer_thread(mut conn: Connection, mut rx: mpsc::Receiver<Command>, bus: EventBus) {
    // Publish events a previous process appended but never delivered.
    if let Err(e) = drain_outbox(&conn, &bus) {
        tracing::warn!("startup outbox drain failed: {e}");
    }

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::InsertOrUpdate { item, reply } => {
                let result = retry_busy(|| in_txn(&mut conn, |txn| insert_or_update(txn, &item)));
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::TouchByHash {
                content_hash,
                used_at,
                reply,
            } => {
                let result = retry_busy(|| {
                    in_txn(&mut conn, |txn| touch_by_hash(txn, &content_hash, used_at))
                });
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::UpdateMetadata {
                id,
                pinned,
                touch_used_at,
                reply,
            } => {
                let result = retry_busy(|| {
                    in_txn(&mut conn, |txn| update_metadata(txn, &id, pinned, touch_used_at))
                });
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::Delete { id, reply } => {
                let result = retry_busy(|| in_txn(&mut conn, |txn| delete_item(txn, &id)));
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::DeleteAll { keep_pinned, reply } => {
                let result =
                    retry_busy(|| in_txn(&mut conn, |txn| delete_all(txn, keep_pinned)));
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::ExecuteCleanup { row_ids, reply } => {
                let result =
                    retry_busy(|| in_txn(&mut conn, |txn| execute_cleanup(txn, &row_ids)));
                finish(&conn, &bus, &result);
                let _ = reply.send(result);
            }
            Command::Shutdown => break,
        }
    }

    tracing::debug!("writer thread shutting down");
}

/// After a committed write, push its outbox rows to the bus.
fn finish<T>(conn: &Connection, bus: &EventBus, result: &Result<T>) {
    if result.is_ok() {
        if let Err(e) = drain_outbox(conn, bus) {
            tracing::warn!("outbox drain failed: {e}");
        }
    }
}

fn in_txn<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction) -> Result<T>,
) -> Result<T> {
    let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&txn)?;
    txn.commit()?;
    Ok(out)
}

/// One internal retry on a busy writer acquire, then surface `DbBusy`.
fn retry_busy<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    match f() {
        Err(Error::DbBusy) => {
            std::thread::sleep(Duration::from_millis(50));
            f()
        }
        other => other,
    }
}

const SUMMARY_COLS: &str = "row_id, id, type, plain_text, app_bundle_id, created_at, \
                            last_used_at, use_count, is_pinned, size_bytes, storage_ref";

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemSummary> {
    let plain_text: Option<String> = row.get(3)?;
    let storage_ref: Option<String> = row.get(10)?;
    let type_str: String = row.get(2)?;
    Ok(ItemSummary {
        row_id: row.get(0)?,
        id: row.get(1)?,
        item_type: ItemType::parse(&type_str).unwrap_or(ItemType::Other),
        preview: ItemSummary::preview_of(plain_text.as_deref().unwrap_or_default()),
        app_bundle_id: row.get(4)?,
        created_at: row.get(5)?,
        last_used_at: row.get(6)?,
        use_count: row.get(7)?,
        is_pinned: row.get(8)?,
        size_bytes: row.get(9)?,
        has_external: storage_ref.is_some(),
    })
}

fn fetch_summary_by_hash(txn: &Transaction, hash: &str) -> Result<ItemSummary> {
    let sql = format!("SELECT {SUMMARY_COLS} FROM items WHERE content_hash = ?1");
    Ok(txn.query_row(&sql, [hash], summary_from_row)?)
}

fn fetch_summary_by_id(txn: &Transaction, id: &str) -> Result<ItemSummary> {
    let sql = format!("SELECT {SUMMARY_COLS} FROM items WHERE id = ?1");
    Ok(txn.query_row(&sql, [id], summary_from_row)?)
}

fn append_outbox(txn: &Transaction, event: &Event) -> Result<()> {
    let payload = serde_json::to_vec(event)
        .map_err(|e| Error::Internal(format!("outbox serialize: {e}")))?;
    txn.execute(
        "INSERT INTO outbox (kind, payload) VALUES (?1, ?2)",
        params![event.kind(), payload],
    )?;
    Ok(())
}

fn drain_outbox(conn: &Connection, bus: &EventBus) -> Result<()> {
    let mut stmt = conn.prepare_cached("SELECT seq, payload FROM outbox ORDER BY seq")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut last_seq = None;
    for row in rows {
        let (seq, payload) = row?;
        match serde_json::from_slice::<Event>(&payload) {
            Ok(event) => bus.publish(event),
            Err(e) => tracing::warn!(seq, "dropping undecodable outbox event: {e}"),
        }
        last_seq = Some(seq);
    }
    drop(stmt);

    if let Some(seq) = last_seq {
        conn.execute("DELETE FROM outbox WHERE seq <= ?1", [seq])?;
    }
    Ok(())
}

fn current_stats(txn: &Transaction) -> Result<Stats> {
    Ok(Stats {
        item_count: meta_get_i64(txn, "item_count")?.max(0) as u64,
        unpinned_count: meta_get_i64(txn, "unpinned_count")?.max(0) as u64,
        inline_bytes: meta_get_i64(txn, "inline_bytes")?.max(0) as u64,
        external_bytes: meta_get_i64(txn, "external_bytes")?.max(0) as u64,
        thumbnail_bytes: 0,
        ingest_dropped: 0,
    })
}

/// Shared dedup bump: returns the updated summary when a row with the hash
/// exists. The caller appends its own outbox event.
fn dedup_bump(txn: &Transaction, content_hash: &str, used_at: f64) -> Result<Option<ItemSummary>> {
    let updated = txn.execute(
        "UPDATE items SET last_used_at = MAX(last_used_at, ?1), use_count = use_count + 1
         WHERE content_hash = ?2",
        params![used_at, content_hash],
    )?;
    if updated > 0 {
        Ok(Some(fetch_summary_by_hash(txn, content_hash)?))
    } else {
        Ok(None)
    }
}

fn touch_by_hash(
    txn: &Transaction,
    content_hash: &str,
    used_at: f64,
) -> Result<Option<ItemSummary>> {
    match dedup_bump(txn, content_hash, used_at)? {
        Some(summary) => {
            append_outbox(txn, &Event::ItemUpdated(summary.clone()))?;
            meta_add_i64(txn, "mutation_seq", 1)?;
            Ok(Some(summary))
        }
        None => Ok(None),
    }
}

fn insert_or_update(txn: &Transaction, item: &NewItem) -> Result<WriteOutcome> {
    // Dedup path first: same hash collapses to a timestamp + use_count bump.
    let outcome = if let Some(summary) =
        dedup_bump(txn, &item.content_hash, item.captured_at)?
    {
        append_outbox(txn, &Event::ItemUpdated(summary.clone()))?;
        WriteOutcome::Updated(summary)
    } else {
        txn.execute(
            "INSERT INTO items (id, type, content_hash, plain_text, app_bundle_id,
                                created_at, last_used_at, use_count, is_pinned,
                                size_bytes, storage_ref, raw_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 0, ?8, ?9, ?10)",
            params![
                item.id,
                item.item_type.as_str(),
                item.content_hash,
                item.plain_text,
                item.app_bundle_id,
                item.captured_at,
                item.captured_at,
                item.size_bytes,
                item.storage_ref.as_ref().map(|p| p.to_string_lossy().into_owned()),
                item.raw_data,
            ],
        )?;

        meta_add_i64(txn, "item_count", 1)?;
        meta_add_i64(txn, "unpinned_count", 1)?;
        if item.storage_ref.is_some() {
            meta_add_i64(txn, "external_bytes", item.size_bytes)?;
        } else {
            meta_add_i64(txn, "inline_bytes", item.size_bytes)?;
        }

        let summary = fetch_summary_by_id(txn, &item.id)?;
        append_outbox(txn, &Event::ItemInserted(summary.clone()))?;
        WriteOutcome::Inserted(summary)
    };

    meta_add_i64(txn, "mutation_seq", 1)?;
    Ok(outcome)
}

fn update_metadata(
    txn: &Transaction,
    id: &str,
    pinned: Option<bool>,
    touch_used_at: Option<f64>,
) -> Result<ItemSummary> {
    let was_pinned: bool = match txn.query_row(
        "SELECT is_pinned FROM items WHERE id = ?1",
        [id],
        |row| row.get(0),
    ) {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::NotFound),
        Err(e) => return Err(e.into()),
    };

    txn.execute(
        "UPDATE items SET
             is_pinned = COALESCE(?1, is_pinned),
             last_used_at = COALESCE(?2, last_used_at)
         WHERE id = ?3",
        params![pinned, touch_used_at, id],
    )?;

    if let Some(now_pinned) = pinned {
        if now_pinned != was_pinned {
            meta_add_i64(txn, "unpinned_count", if now_pinned { -1 } else { 1 })?;
        }
    }

    let summary = fetch_summary_by_id(txn, id)?;
    append_outbox(txn, &Event::ItemUpdated(summary.clone()))?;
    meta_add_i64(txn, "mutation_seq", 1)?;
    Ok(summary)
}

fn delete_item(txn: &Transaction, id: &str) -> Result<Option<PathBuf>> {
    let row = txn.query_row(
        "SELECT is_pinned, size_bytes, storage_ref FROM items WHERE id = ?1",
        [id],
        |row| {
            Ok((
                row.get::<_, bool>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        },
    );
    let (is_pinned, size_bytes, storage_ref) = match row {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::NotFound),
        Err(e) => return Err(e.into()),
    };

    txn.execute("DELETE FROM items WHERE id = ?1", [id])?;

    meta_add_i64(txn, "item_count", -1)?;
    if !is_pinned {
        meta_add_i64(txn, "unpinned_count", -1)?;
    }
    if storage_ref.is_some() {
        meta_add_i64(txn, "external_bytes", -size_bytes)?;
    } else {
        meta_add_i64(txn, "inline_bytes", -size_bytes)?;
    }

    append_outbox(txn, &Event::ItemDeleted { id: id.to_string() })?;
    meta_add_i64(txn, "mutation_seq", 1)?;
    Ok(storage_ref.map(PathBuf::from))
}

fn delete_all(txn: &Transaction, keep_pinned: bool) -> Result<CleanupExecution> {
    let predicate = if keep_pinned { "is_pinned = 0" } else { "1=1" };

    let mut reclaim = Vec::new();
    let mut deleted_ids = Vec::new();
    {
        let sql = format!("SELECT id, storage_ref FROM items WHERE {predicate}");
        let mut stmt = txn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for r in rows {
            let (id, storage_ref) = r?;
            if let Some(path) = storage_ref {
                reclaim.push(PathBuf::from(path));
            }
            deleted_ids.push(id);
        }
    }

    let deleted = txn.execute(&format!("DELETE FROM items WHERE {predicate}"), [])?;

    reseed_counters(txn)?;
    append_outbox(txn, &Event::ItemsCleared { keep_pinned })?;
    append_outbox(txn, &Event::StatsChanged(current_stats(txn)?))?;
    meta_add_i64(txn, "mutation_seq", 1)?;
    Ok(CleanupExecution {
        deleted,
        reclaim,
        deleted_ids,
    })
}

fn execute_cleanup(txn: &Transaction, row_ids: &[i64]) -> Result<CleanupExecution> {
    let mut reclaim = Vec::new();
    let mut deleted_ids = Vec::new();
    let mut deleted = 0usize;

    // Chunked so the bound-parameter list stays well under SQLite limits.
    for chunk in row_ids.chunks(256) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let values: Vec<&dyn rusqlite::ToSql> =
            chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

        {
            let sql = format!(
                "SELECT id, storage_ref FROM items WHERE row_id IN ({placeholders})"
            );
            let mut stmt = txn.prepare(&sql)?;
            let rows = stmt.query_map(&values[..], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            for r in rows {
                let (id, storage_ref) = r?;
                if let Some(path) = storage_ref {
                    reclaim.push(PathBuf::from(path));
                }
                append_outbox(txn, &Event::ItemDeleted { id: id.clone() })?;
                deleted_ids.push(id);
            }
        }

        let sql = format!("DELETE FROM items WHERE row_id IN ({placeholders})");
        deleted += txn.execute(&sql, &values[..])?;
    }

    if deleted > 0 {
        reseed_counters(txn)?;
        append_outbox(txn, &Event::StatsChanged(current_stats(txn)?))?;
    }
    meta_add_i64(txn, "mutation_seq", 1)?;
    Ok(CleanupExecution {
        deleted,
        reclaim,
        deleted_ids,
    })
}

/// Bulk deletions recompute the counters from the surviving rows instead of
/// applying per-row deltas.
fn reseed_counters(txn: &Transaction) -> Result<()> {
    txn.execute_batch(
        r#"
        INSERT INTO meta (key, value)
            SELECT 'item_count', COUNT(*) FROM items WHERE true
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
        INSERT INTO meta (key, value)
            SELECT 'unpinned_count', COUNT(*) FROM items WHERE is_pinned = 0
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
        INSERT INTO meta (key, value)
            SELECT 'inline_bytes', COALESCE(SUM(size_bytes), 0)
            FROM items WHERE storage_ref IS NULL
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
        INSERT INTO meta (key, value)
            SELECT 'external_bytes', COALESCE(SUM(size_bytes), 0)
            FROM items WHERE storage_ref IS NOT NULL
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_and_migrate;

    fn new_text_item(id: &str, text: &str, at: f64) -> NewItem {
        NewItem {
            id: id.to_string(),
            item_type: ItemType::Text,
            content_hash: crate::hash::hash_text(text),
            plain_text: text.to_string(),
            app_bundle_id: None,
            captured_at: at,
            size_bytes: text.len() as i64,
            storage_ref: None,
            raw_data: None,
        }
    }

    async fn spawn_writer() -> (tempfile::TempDir, StoreWriter, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_and_migrate(&dir.path().join("clipboard.db")).unwrap();
        let bus = EventBus::default();
        let writer = StoreWriter::spawn(conn, bus.clone()).unwrap();
        (dir, writer, bus)
    }

    #[tokio::test]
    async fn insert_then_dedup_bumps_single_row() {
        let (_dir, writer, _bus) = spawn_writer().await;

        let first = writer
            .insert_or_update(new_text_item("a", "hello world", 100.0))
            .await
            .unwrap();
        assert!(matches!(first, WriteOutcome::Inserted(_)));

        let second = writer
            .insert_or_update(new_text_item("b", "hello world", 200.0))
            .await
            .unwrap();
        match second {
            WriteOutcome::Updated(s) => {
                assert_eq!(s.use_count, 2);
                assert_eq!(s.last_used_at, 200.0);
                assert_eq!(s.id, "a"); // identity is stable across dedup
            }
            other => panic!("expected dedup update, got {other:?}"),
        }

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn dedup_keeps_max_timestamp() {
        let (_dir, writer, _bus) = spawn_writer().await;
        writer
            .insert_or_update(new_text_item("a", "x", 500.0))
            .await
            .unwrap();
        let out = writer
            .insert_or_update(new_text_item("b", "x", 100.0))
            .await
            .unwrap();
        assert_eq!(out.summary().last_used_at, 500.0);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn pin_adjusts_unpinned_counter_and_emits_update() {
        let (_dir, writer, bus) = spawn_writer().await;
        let mut rx = bus.subscribe_raw();

        writer
            .insert_or_update(new_text_item("a", "pin me", 1.0))
            .await
            .unwrap();
        let summary = writer.update_metadata("a", Some(true), None).await.unwrap();
        assert!(summary.is_pinned);

        assert!(matches!(rx.recv().await.unwrap(), Event::ItemInserted(_)));
        assert!(matches!(rx.recv().await.unwrap(), Event::ItemUpdated(_)));

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn update_metadata_missing_is_not_found() {
        let (_dir, writer, _bus) = spawn_writer().await;
        let err = writer.update_metadata("ghost", Some(true), None).await;
        assert!(matches!(err, Err(Error::NotFound)));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn delete_returns_storage_ref() {
        let (_dir, writer, _bus) = spawn_writer().await;
        let mut item = new_text_item("a", "external", 1.0);
        item.storage_ref = Some(PathBuf::from("/tmp/blob.bin"));
        writer.insert_or_update(item).await.unwrap();

        let reclaimed = writer.delete("a").await.unwrap();
        assert_eq!(reclaimed, Some(PathBuf::from("/tmp/blob.bin")));

        let err = writer.delete("a").await;
        assert!(matches!(err, Err(Error::NotFound)));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn delete_all_keep_pinned_spares_pins() {
        let (_dir, writer, bus) = spawn_writer().await;
        writer
            .insert_or_update(new_text_item("a", "keep", 1.0))
            .await
            .unwrap();
        writer
            .insert_or_update(new_text_item("b", "drop", 2.0))
            .await
            .unwrap();
        writer.update_metadata("a", Some(true), None).await.unwrap();

        let mut rx = bus.subscribe_raw();
        writer.delete_all(true).await.unwrap();

        // ItemsCleared arrives before the stats snapshot (commit order).
        loop {
            match rx.recv().await.unwrap() {
                Event::ItemsCleared { keep_pinned } => {
                    assert!(keep_pinned);
                    break;
                }
                _ => continue,
            }
        }
        match rx.recv().await.unwrap() {
            Event::StatsChanged(stats) => assert_eq!(stats.item_count, 1),
            other => panic!("expected stats snapshot, got {other:?}"),
        }

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn mutation_seq_strictly_increases() {
        let (dir, writer, _bus) = spawn_writer().await;
        writer
            .insert_or_update(new_text_item("a", "one", 1.0))
            .await
            .unwrap();
        writer
            .insert_or_update(new_text_item("b", "two", 2.0))
            .await
            .unwrap();
        writer.delete("a").await.unwrap();
        writer.shutdown().await;

        let conn = rusqlite::Connection::open(dir.path().join("clipboard.db")).unwrap();
        let seq: i64 = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'mutation_seq'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(seq, 3);
    }

    #[tokio::test]
    async fn cleanup_deletes_rows_and_collects_refs() {
        let (_dir, writer, _bus) = spawn_writer().await;
        for i in 0..10 {
            let mut item = new_text_item(&format!("id{i}"), &format!("text {i}"), i as f64);
            if i % 2 == 0 {
                item.storage_ref = Some(PathBuf::from(format!("/blobs/{i}")));
            }
            writer.insert_or_update(item).await.unwrap();
        }

        let out = writer.execute_cleanup((1..=4).collect()).await.unwrap();
        assert_eq!(out.deleted, 4);
        assert_eq!(out.reclaim.len(), 2); // rows 1 and 3 carried refs
        writer.shutdown().await;
    }
}
