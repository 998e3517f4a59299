//! Persistence layer: single-writer repository over SQLite + FTS5
//!
//! # Architecture
//!
//! ```text
//! Facade / Ingest                    Search Engine
//!       │                                 │
//!       └──→ StoreWriter (tx)             └──→ StoreReader (read-only conn)
//!               │                                 │
//!               └──→ Dedicated Writer Thread      ├──→ FTS5 MATCH queries
//!                       │                         └──→ fetch/statistics/planning
//!                       ├──→ items / items_fts / meta / outbox
//!                       └──→ outbox drain → EventBus (after commit)
//! ```
//!
//! Both connections run WAL journaling with a bounded busy timeout. The
//! writer serializes every mutation; readers see snapshot-isolated state.

mod reader;
mod schema;
mod writer;

pub use reader::StoreReader;
pub use schema::open_and_migrate;
pub use writer::{CleanupExecution, StoreWriter, WriteOutcome};

use crate::util::truncate_utf8_safe;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bytes of `plain_text` carried in UI-facing summaries.
const PREVIEW_MAX_BYTES: usize = 256;

/// Content classification of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Text,
    Rtf,
    Html,
    Image,
    File,
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Text => "text",
            ItemType::Rtf => "rtf",
            ItemType::Html => "html",
            ItemType::Image => "image",
            ItemType::File => "file",
            ItemType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ItemType::Text),
            "rtf" => Some(ItemType::Rtf),
            "html" => Some(ItemType::Html),
            "image" => Some(ItemType::Image),
            "file" => Some(ItemType::File),
            "other" => Some(ItemType::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully materialized clipboard item row.
#[derive(Debug, Clone)]
pub struct Item {
    pub row_id: i64,
    pub id: String,
    pub item_type: ItemType,
    pub content_hash: String,
    pub plain_text: String,
    pub app_bundle_id: Option<String>,
    pub created_at: f64,
    pub last_used_at: f64,
    pub use_count: i64,
    pub is_pinned: bool,
    pub size_bytes: i64,
    pub storage_ref: Option<PathBuf>,
    pub raw_data: Option<Vec<u8>>,
}

/// Insert payload handed to the writer. `row_id` and `use_count` are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: String,
    pub item_type: ItemType,
    pub content_hash: String,
    pub plain_text: String,
    pub app_bundle_id: Option<String>,
    pub captured_at: f64,
    pub size_bytes: i64,
    pub storage_ref: Option<PathBuf>,
    pub raw_data: Option<Vec<u8>>,
}

/// UI-facing projection of an item: everything a list row needs, without
/// the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: String,
    pub row_id: i64,
    pub item_type: ItemType,
    pub preview: String,
    pub app_bundle_id: Option<String>,
    pub created_at: f64,
    pub last_used_at: f64,
    pub use_count: i64,
    pub is_pinned: bool,
    pub size_bytes: i64,
    pub has_external: bool,
}

impl ItemSummary {
    pub fn preview_of(plain_text: &str) -> String {
        truncate_utf8_safe(plain_text, PREVIEW_MAX_BYTES).to_string()
    }
}

/// O(1) counters maintained by the writer inside every transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub item_count: u64,
    pub unpinned_count: u64,
    pub inline_bytes: u64,
    pub external_bytes: u64,
    pub thumbnail_bytes: u64,
    pub ingest_dropped: u64,
}

/// Optional filters shared by `fetch_recent` and search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RecentFilter {
    pub app_bundle_id: Option<String>,
    /// Sorted set of accepted types; `None` accepts all.
    pub types: Option<Vec<ItemType>>,
}

impl RecentFilter {
    pub fn is_empty(&self) -> bool {
        self.app_bundle_id.is_none() && self.types.is_none()
    }

    /// Canonicalize so equal filters compare and hash equal.
    pub fn normalized(mut self) -> Self {
        if let Some(types) = self.types.as_mut() {
            types.sort();
            types.dedup();
            if types.is_empty() {
                self.types = None;
            }
        }
        self
    }
}

/// Row projection streamed into the fuzzy index, the short-query cache and
/// delta updates. Carries just enough metadata to apply app/type filters
/// without touching the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRow {
    pub row_id: i64,
    pub id: String,
    pub plain_text: String,
    pub app_bundle_id: Option<String>,
    pub item_type: ItemType,
    pub is_pinned: bool,
    pub last_used_at: f64,
}

impl IndexRow {
    /// App/type filter check shared by the in-memory search paths.
    pub fn matches(&self, filter: &RecentFilter) -> bool {
        if let Some(app) = &filter.app_bundle_id {
            if self.app_bundle_id.as_deref() != Some(app.as_str()) {
                return false;
            }
        }
        if let Some(types) = &filter.types {
            if !types.contains(&self.item_type) {
                return false;
            }
        }
        true
    }
}
