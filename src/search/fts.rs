//! FTS5 query building and execution (exact mode)
//!
//! Exact-mode queries of length >= 3 compile to an FTS5 MATCH expression:
//! whitespace-split tokens, each quoted with internal quotes doubled (the
//! FTS5 escape), ANDed together. Ranking is BM25; the engine stores the
//! negated rank so one descending sort order serves every mode.

use super::Ranked;
use crate::error::{Error, Result};
use crate::store::RecentFilter;
use rusqlite::{params, Connection};
use tokio_util::sync::CancellationToken;

/// Rows between cancellation checks while draining a result set.
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Build the MATCH expression for an exact query. Returns `None` when the
/// query holds no usable tokens.
pub fn build_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

fn types_json(filter: &RecentFilter) -> Option<String> {
    filter.types.as_ref().map(|types| {
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".into())
    })
}

/// Run an FTS MATCH and collect ranked rows. `limit` bounds prefilter runs;
/// `None` drains the full match set (the paging cache keeps the result).
pub fn fts_query(
    conn: &Connection,
    match_expr: &str,
    filter: &RecentFilter,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<Vec<Ranked>> {
    let mut stmt = conn.prepare_cached(
        "SELECT i.row_id, bm25(items_fts), i.is_pinned, i.last_used_at
         FROM items_fts
         JOIN items i ON i.row_id = items_fts.rowid
         WHERE items_fts MATCH ?1
           AND (?2 IS NULL OR i.app_bundle_id = ?2)
           AND (?3 IS NULL OR i.type IN (SELECT value FROM json_each(?3)))
         ORDER BY bm25(items_fts)
         LIMIT ?4",
    )?;

    let sql_limit = limit.map(|n| n as i64).unwrap_or(-1);
    let rows = stmt.query_map(
        params![match_expr, filter.app_bundle_id, types_json(filter), sql_limit],
        |row| {
            let rank: f64 = row.get(1)?;
            Ok(Ranked {
                row_id: row.get(0)?,
                // BM25 is "lower is better"; negate for the shared sort.
                score: -rank,
                is_pinned: row.get(2)?,
                last_used_at: row.get(3)?,
            })
        },
    )?;

    let mut out = Vec::new();
    for (n, row) in rows.enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        out.push(row?);
    }
    Ok(out)
}

/// Full-table substring scan used when a short exact query is refined with
/// `force_full` - FTS tokens cannot express a 1-2 character substring, so
/// this walks `instr(lower(plain_text), needle)` instead.
pub fn substring_scan(
    conn: &Connection,
    needle_lower: &str,
    filter: &RecentFilter,
    cancel: &CancellationToken,
) -> Result<Vec<Ranked>> {
    let mut stmt = conn.prepare_cached(
        "SELECT row_id, is_pinned, last_used_at
         FROM items
         WHERE instr(lower(plain_text), ?1) > 0
           AND (?2 IS NULL OR app_bundle_id = ?2)
           AND (?3 IS NULL OR type IN (SELECT value FROM json_each(?3)))",
    )?;

    let rows = stmt.query_map(
        params![needle_lower, filter.app_bundle_id, types_json(filter)],
        |row| {
            Ok(Ranked {
                row_id: row.get(0)?,
                score: 0.0,
                is_pinned: row.get(1)?,
                last_used_at: row.get(2)?,
            })
        },
    )?;

    let mut out = Vec::new();
    for (n, row) in rows.enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        out.push(row?);
    }
    Ok(out)
}
