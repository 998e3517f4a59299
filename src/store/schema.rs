//! Schema and forward-only migrations
//!
//! The schema version lives in two places: the `meta` table (authoritative,
//! readable by plain SQL) and `PRAGMA user_version` (cheap to probe without
//! touching tables). Each migration runs in a single transaction and is
//! idempotent - if the process dies between COMMIT and the next startup, the
//! version check simply skips work already done.

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 3;

/// Open the writable connection, apply pragmas and run pending migrations.
pub fn open_and_migrate(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Connection-level settings applied to every handle (writer and reader).
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA cache_size=-64000;  -- 64MB cache
        "#,
    )?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    let current = current_version(conn);

    if current < 1 {
        apply_schema_v1(conn)?;
    }
    if current < 2 {
        migrate_v1_to_v2(conn)?;
    }
    if current < 3 {
        migrate_v2_to_v3(conn)?;
    }

    Ok(())
}

fn current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COALESCE(
            (SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'schema_version'),
            0
        )",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

fn set_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [version],
    )?;
    // Mirror into the file header for tooling that probes without SQL.
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))?;
    Ok(())
}

/// Initial schema (v1): items, meta and the lookup indexes.
fn apply_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;

        -- Meta key/value store (created first for version tracking)
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        -- Clipboard items
        CREATE TABLE IF NOT EXISTS items (
            row_id INTEGER PRIMARY KEY,
            id TEXT UNIQUE NOT NULL,
            type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            plain_text TEXT,
            app_bundle_id TEXT,
            created_at REAL NOT NULL,
            last_used_at REAL NOT NULL,
            use_count INTEGER DEFAULT 1,
            is_pinned INTEGER DEFAULT 0,
            size_bytes INTEGER NOT NULL,
            storage_ref TEXT,
            raw_data BLOB
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_items_hash ON items(content_hash);
        CREATE INDEX IF NOT EXISTS idx_items_recency ON items(is_pinned DESC, last_used_at DESC);
        CREATE INDEX IF NOT EXISTS idx_items_type ON items(type, last_used_at DESC);
        CREATE INDEX IF NOT EXISTS idx_items_app ON items(app_bundle_id, last_used_at DESC);

        COMMIT;
        "#,
    )?;
    set_version(conn, 1)?;
    tracing::info!("Applied schema v1");
    Ok(())
}

/// v1 -> v2: full-text index over plain_text.
///
/// External-content FTS5: the text is stored once in `items`; the virtual
/// table only carries the inverted index. Triggers keep the two in sync.
/// The UPDATE trigger fires on `plain_text` changes only - metadata updates
/// (dedup timestamp bumps, pins, use counts) are the overwhelmingly common
/// write and must not rewrite FTS rows.
///
/// A database migrated from v1 may already hold rows, so the migration ends
/// with the FTS5 'rebuild' command to index pre-existing content.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='items_fts'",
        [],
        |row| row.get(0),
    )?;

    if !has_table {
        conn.execute_batch(
            r#"
            BEGIN;

            CREATE VIRTUAL TABLE items_fts USING fts5(
                plain_text,
                content='items',
                content_rowid='row_id',
                tokenize='unicode61 remove_diacritics 2'
            );

            CREATE TRIGGER items_fts_ai AFTER INSERT ON items BEGIN
                INSERT INTO items_fts(rowid, plain_text)
                VALUES (new.row_id, new.plain_text);
            END;

            CREATE TRIGGER items_fts_ad AFTER DELETE ON items BEGIN
                INSERT INTO items_fts(items_fts, rowid, plain_text)
                VALUES ('delete', old.row_id, old.plain_text);
            END;

            CREATE TRIGGER items_fts_au AFTER UPDATE OF plain_text ON items BEGIN
                INSERT INTO items_fts(items_fts, rowid, plain_text)
                VALUES ('delete', old.row_id, old.plain_text);
                INSERT INTO items_fts(rowid, plain_text)
                VALUES (new.row_id, new.plain_text);
            END;

            -- Index rows that existed before FTS was introduced.
            INSERT INTO items_fts(items_fts) VALUES ('rebuild');

            COMMIT;
            "#,
        )?;
    }

    set_version(conn, 2)?;
    tracing::info!("Migrated clipboard database from v1 to v2 (FTS index)");
    Ok(())
}

/// v2 -> v3: outbox event queue and maintained counters.
///
/// Counters are seeded from the live rows so `statistics()` is an O(1) read
/// from then on; the writer keeps them current inside each transaction.
fn migrate_v2_to_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload BLOB NOT NULL
        );

        INSERT INTO meta (key, value) VALUES ('mutation_seq', '0')
            ON CONFLICT(key) DO NOTHING;
        -- The WHERE clauses keep the upsert parseable (SQLite requires a
        -- WHERE on SELECT-sourced INSERT .. ON CONFLICT).
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

        COMMIT;
        "#,
    )?;

    set_version(conn, 3)?;
    tracing::info!("Migrated clipboard database from v2 to v3 (outbox + counters)");
    Ok(())
}

/// Read an integer meta counter; missing keys read as 0.
pub(crate) fn meta_get_i64(conn: &Connection, key: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM meta WHERE key = ?1), 0)",
        [key],
        |row| row.get(0),
    )
}

/// Add `delta` to an integer meta counter.
pub(crate) fn meta_add_i64(conn: &Connection, key: &str, delta: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + ?2",
        rusqlite::params![key, delta],
    )?;
    Ok(())
}
