//! Read-only repository handle
//!
//! The search engine (and the cleanup planner) own one pinned read-only
//! connection. Pinning matters for cancellation: `interrupt` must hit the
//! connection that is actually executing the query, so a pool is the wrong
//! shape here. WAL mode gives this connection snapshot isolation while the
//! writer commits.
//!
//! Prepared statements go through the connection's LRU statement cache
//! (bound 32, bindings reset on every reuse). Filtered queries keep their
//! SQL shape count finite by passing the type set as a JSON array through
//! `json_each`.

use super::schema::meta_get_i64;
use super::{Item, ItemSummary, ItemType, RecentFilter, Stats};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const STATEMENT_CACHE_CAPACITY: usize = 32;

pub struct StoreReader {
    conn: Connection,
}

impl StoreReader {
    /// Open the read-only handle. The writer must have created and migrated
    /// the database first.
    pub fn open(db_path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| Error::DbOpen(e.to_string()))?;

        conn.execute_batch(
            r#"
            PRAGMA busy_timeout=5000;
            PRAGMA cache_size=-64000;
            PRAGMA query_only=ON;
            "#,
        )?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        Ok(Self { conn })
    }

    /// Handle the facade uses to abort an in-progress SQL step on
    /// cancellation or timeout.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Monotonic change token; compared against cache/index generations.
    pub fn mutation_seq(&self) -> Result<u64> {
        Ok(meta_get_i64(&self.conn, "mutation_seq")?.max(0) as u64)
    }

    /// Open an explicit read transaction. In WAL mode every read until
    /// [`end_read`](Self::end_read) sees the snapshot taken at the first
    /// read, so a multi-statement query cannot tear across a concurrent
    /// commit.
    pub fn begin_read(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Close the read transaction. Read commits cannot meaningfully fail;
    /// an interrupted statement may have rolled the transaction back
    /// already, which is fine too.
    pub fn end_read(&self) {
        if self.conn.execute_batch("COMMIT").is_err() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }

    /// O(1) statistics from the maintained counters.
    pub fn statistics(&self) -> Result<Stats> {
        Ok(Stats {
            item_count: meta_get_i64(&self.conn, "item_count")?.max(0) as u64,
            unpinned_count: meta_get_i64(&self.conn, "unpinned_count")?.max(0) as u64,
            inline_bytes: meta_get_i64(&self.conn, "inline_bytes")?.max(0) as u64,
            external_bytes: meta_get_i64(&self.conn, "external_bytes")?.max(0) as u64,
            thumbnail_bytes: 0,
            ingest_dropped: 0,
        })
    }

    /// Recency listing: `(is_pinned DESC, last_used_at DESC, row_id ASC)`.
    /// Fetches `limit + 1` rows so `has_more` needs no COUNT.
    pub fn fetch_recent(
        &self,
        limit: usize,
        offset: usize,
        filter: &RecentFilter,
    ) -> Result<(Vec<ItemSummary>, bool)> {
        let sql = format!(
            "SELECT {SUMMARY_COLS} FROM items
             WHERE (?1 IS NULL OR app_bundle_id = ?1)
               AND (?2 IS NULL OR type IN (SELECT value FROM json_each(?2)))
             ORDER BY is_pinned DESC, last_used_at DESC, row_id ASC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.app_bundle_id,
                types_json(filter),
                (limit + 1) as i64,
                offset as i64
            ],
            summary_from_row,
        )?;

        let mut items = Vec::with_capacity(limit + 1);
        for row in rows {
            items.push(row?);
        }
        let has_more = items.len() > limit;
        items.truncate(limit);
        Ok((items, has_more))
    }

    /// Materialize summaries for the given row ids, in the input order.
    pub fn fetch_by_row_ids(&self, row_ids: &[i64]) -> Result<Vec<ItemSummary>> {
        let mut by_id: HashMap<i64, ItemSummary> = HashMap::with_capacity(row_ids.len());

        for chunk in row_ids.chunks(256) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT {SUMMARY_COLS} FROM items WHERE row_id IN ({placeholders})"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let values: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let rows = stmt.query_map(&values[..], summary_from_row)?;
            for row in rows {
                let summary = row?;
                by_id.insert(summary.row_id, summary);
            }
        }

        Ok(row_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    /// Full row for preview loading and pasteboard copies.
    pub fn load_item(&self, id: &str) -> Result<Item> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT row_id, id, type, content_hash, plain_text, app_bundle_id,
                    created_at, last_used_at, use_count, is_pinned, size_bytes,
                    storage_ref, raw_data
             FROM items WHERE id = ?1",
        )?;
        match stmt.query_row([id], |row| {
            let type_str: String = row.get(2)?;
            let plain_text: Option<String> = row.get(4)?;
            let storage_ref: Option<String> = row.get(11)?;
            Ok(Item {
                row_id: row.get(0)?,
                id: row.get(1)?,
                item_type: ItemType::parse(&type_str).unwrap_or(ItemType::Other),
                content_hash: row.get(3)?,
                plain_text: plain_text.unwrap_or_default(),
                app_bundle_id: row.get(5)?,
                created_at: row.get(6)?,
                last_used_at: row.get(7)?,
                use_count: row.get(8)?,
                is_pinned: row.get(9)?,
                size_bytes: row.get(10)?,
                storage_ref: storage_ref.map(PathBuf::from),
                raw_data: row.get(12)?,
            })
        }) {
            Ok(item) => Ok(item),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream index rows in row_id order for fuzzy-index builds. The
    /// callback returns `false` to stop early (cancellation).
    pub fn stream_index_rows(
        &self,
        mut visit: impl FnMut(super::IndexRow) -> bool,
    ) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {INDEX_COLS} FROM items ORDER BY row_id ASC"
        ))?;
        let rows = stmt.query_map([], index_row_from_row)?;

        for row in rows {
            if !visit(row?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every live external storage ref, for the orphan sweep.
    pub fn all_storage_refs(&self) -> Result<std::collections::HashSet<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT storage_ref FROM items WHERE storage_ref IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut refs = std::collections::HashSet::new();
        for row in rows {
            refs.insert(PathBuf::from(row?));
        }
        Ok(refs)
    }

    /// Most recent `limit` rows (pinned first) with full text, for the
    /// short-query cache mirror.
    pub fn fetch_cache_rows(&self, limit: usize) -> Result<Vec<super::IndexRow>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {INDEX_COLS} FROM items
             ORDER BY is_pinned DESC, last_used_at DESC, row_id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], index_row_from_row)?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const INDEX_COLS: &str =
    "row_id, id, plain_text, app_bundle_id, type, is_pinned, last_used_at";

fn index_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<super::IndexRow> {
    let plain_text: Option<String> = row.get(2)?;
    let type_str: String = row.get(4)?;
    Ok(super::IndexRow {
        row_id: row.get(0)?,
        id: row.get(1)?,
        plain_text: plain_text.unwrap_or_default(),
        app_bundle_id: row.get(3)?,
        item_type: ItemType::parse(&type_str).unwrap_or(ItemType::Other),
        is_pinned: row.get(5)?,
        last_used_at: row.get(6)?,
    })
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

fn types_json(filter: &RecentFilter) -> Option<String> {
    filter.types.as_ref().map(|types| {
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".into())
    })
}
