//! Engine-side caches
//!
//! - Short-query cache: a mirror of the most recent N items that serves 1-2
//!   character queries and regex mode without touching FTS.
//! - Paging cache: fully ordered result lists keyed by
//!   `(mode, query, filters, force_full, generation)`, so deep paging is a
//!   slice instead of a recompute. Keys embed the generation, which makes
//!   every entry self-invalidating once `mutation_seq` advances.
//!
//! Both live on the engine thread; no path mutates them after a
//! cancellation fires.

use super::{Ranked, SearchMode};
use crate::store::ItemType;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Paging-cache entries kept before LRU eviction.
const PAGING_CACHE_ENTRIES: usize = 8;

/// Short-query cache time-to-live.
pub const SHORT_CACHE_TTL: Duration = Duration::from_secs(30);

/// One mirrored item. Text is kept in both original and lowercased form:
/// regex runs on the original, substring matching on the lowercased copy.
#[derive(Debug, Clone)]
pub struct CachedItem {
    pub row_id: i64,
    pub text: String,
    pub text_lower: String,
    pub app_bundle_id: Option<String>,
    pub item_type: ItemType,
    pub is_pinned: bool,
    pub last_used_at: f64,
}

impl CachedItem {
    pub fn from_row(row: crate::store::IndexRow) -> Self {
        Self {
            row_id: row.row_id,
            text_lower: row.plain_text.to_lowercase(),
            text: row.plain_text,
            app_bundle_id: row.app_bundle_id,
            item_type: row.item_type,
            is_pinned: row.is_pinned,
            last_used_at: row.last_used_at,
        }
    }

    pub fn matches_filter(&self, filter: &crate::store::RecentFilter) -> bool {
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

/// Most-recent-N mirror with TTL + generation freshness.
pub struct ShortQueryCache {
    items: Vec<CachedItem>,
    generation: u64,
    built_at: Option<Instant>,
}

impl ShortQueryCache {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            generation: 0,
            built_at: None,
        }
    }

    /// Fresh = built for the current mutation_seq and within TTL.
    pub fn is_fresh(&self, generation: u64) -> bool {
        self.generation == generation
            && self
                .built_at
                .map(|t| t.elapsed() < SHORT_CACHE_TTL)
                .unwrap_or(false)
    }

    pub fn replace(&mut self, items: Vec<CachedItem>, generation: u64) {
        self.items = items;
        self.generation = generation;
        self.built_at = Some(Instant::now());
    }

    pub fn items(&self) -> &[CachedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn invalidate(&mut self) {
        self.built_at = None;
    }
}

/// Cache key for one fully computed result list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub mode: SearchMode,
    pub query: String,
    pub app_bundle_id: Option<String>,
    pub types: Option<Vec<ItemType>>,
    pub force_full: bool,
    pub generation: u64,
}

/// A fully computed, fully ordered result. `total = -1` marks a prefilter
/// (the page is honest about being partial).
pub struct ResultList {
    pub rows: Vec<Ranked>,
    pub total: i64,
}

/// LRU over ordered result lists.
pub struct PagingCache {
    inner: LruCache<PageKey, Arc<ResultList>>,
}

impl PagingCache {
    pub fn new() -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(PAGING_CACHE_ENTRIES).unwrap()),
        }
    }

    pub fn get(&mut self, key: &PageKey) -> Option<Arc<ResultList>> {
        self.inner.get(key).cloned()
    }

    pub fn put(&mut self, key: PageKey, result: Arc<ResultList>) {
        self.inner.put(key, result);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(row_id: i64, text: &str) -> CachedItem {
        CachedItem {
            row_id,
            text: text.to_string(),
            text_lower: text.to_lowercase(),
            app_bundle_id: None,
            item_type: ItemType::Text,
            is_pinned: false,
            last_used_at: row_id as f64,
        }
    }

    #[test]
    fn short_cache_freshness_tracks_generation() {
        let mut cache = ShortQueryCache::new();
        assert!(!cache.is_fresh(0));

        cache.replace(vec![cached(1, "hi")], 7);
        assert!(cache.is_fresh(7));
        assert!(!cache.is_fresh(8)); // any committed write invalidates

        cache.invalidate();
        assert!(!cache.is_fresh(7));
    }

    #[test]
    fn paging_cache_distinguishes_generation_and_mode() {
        let mut cache = PagingCache::new();
        let rows = Arc::new(ResultList {
            rows: vec![Ranked {
                row_id: 1,
                score: 1.0,
                is_pinned: false,
                last_used_at: 1.0,
            }],
            total: 1,
        });

        let key = PageKey {
            mode: SearchMode::FuzzyPlus,
            query: "abc".into(),
            app_bundle_id: None,
            types: None,
            force_full: false,
            generation: 3,
        };
        cache.put(key.clone(), rows);

        assert!(cache.get(&key).is_some());
        assert!(cache
            .get(&PageKey {
                generation: 4,
                ..key.clone()
            })
            .is_none());
        assert!(cache
            .get(&PageKey {
                mode: SearchMode::Fuzzy,
                ..key.clone()
            })
            .is_none());

        cache.clear();
        assert!(cache.get(&key).is_none());
    }
}
