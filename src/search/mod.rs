//! Multi-mode search engine
//!
//! # Architecture
//!
//! ```text
//! Facade (async)
//!     │  bounded mpsc, FIFO
//!     └──→ Engine Thread (owns the read-only connection + caches)
//!             ├──→ exact:      FTS5 MATCH (>= 3 chars) / short-query cache
//!             ├──→ fuzzy:      char-posting candidates → subsequence scores
//!             ├──→ fuzzy_plus: same candidates, contiguous ASCII tokens
//!             ├──→ regex:      short-query cache scan
//!             └──→ paging cache slices for deep offsets
//! ```
//!
//! One thread serializes query execution, exactly like the writer thread
//! serializes mutations. Hot loops check the request's cancellation token;
//! the facade additionally fires `interrupt` on the read connection so an
//! in-flight SQL step aborts too. No cache is mutated on a cancelled path.
//!
//! Every query starts by reading `meta.mutation_seq`. Cache keys embed it,
//! and a fuzzy index whose generation drifted from it is rebuilt rather
//! than trusted - an external write or missed delta can make the index lie,
//! and a rebuild is the only honest answer.

mod cache;
mod fts;
mod fuzzy;

pub use fuzzy::{DbFingerprint, FuzzyIndex};

use crate::cleanup::{plan_deletions, CleanupPlan};
use crate::config::{DataPaths, Settings};
use crate::error::{Error, Result};
use crate::store::{IndexRow, Item, ItemSummary, ItemType, RecentFilter, Stats, StoreReader};
use cache::{CachedItem, PageKey, PagingCache, ResultList, ShortQueryCache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use unicode_normalization::UnicodeNormalization;

/// Per-request deadline enforced by the facade.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);
/// The first fuzzy query may pay for a full index build.
pub const FIRST_BUILD_DEADLINE: Duration = Duration::from_secs(30);

/// Candidate sets at or above this size answer with a prefilter first.
const LARGE_CANDIDATE_THRESHOLD: usize = 6000;
/// Rows returned by the FTS prefilter screen.
const PREFILTER_FTS_LIMIT: usize = 200;
/// Candidates scored by the recency prefilter screen.
const PREFILTER_RECENT_LIMIT: usize = 2000;
/// Scoring iterations between cancellation checks.
const SCORE_CANCEL_INTERVAL: usize = 512;
/// Engine command queue bound.
const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Exact,
    Fuzzy,
    FuzzyPlus,
    Regex,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Exact => "exact",
            SearchMode::Fuzzy => "fuzzy",
            SearchMode::FuzzyPlus => "fuzzy_plus",
            SearchMode::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(SearchMode::Exact),
            "fuzzy" => Some(SearchMode::Fuzzy),
            "fuzzy_plus" => Some(SearchMode::FuzzyPlus),
            "regex" => Some(SearchMode::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub app_filter: Option<String>,
    pub type_filter: Option<Vec<ItemType>>,
    pub limit: usize,
    pub offset: usize,
    /// Progressive refine: recompute over the full corpus even where a
    /// prefilter would normally answer first.
    pub force_full: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
            app_filter: None,
            type_filter: None,
            limit: 50,
            offset: 0,
            force_full: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultPage {
    pub items: Vec<ItemSummary>,
    /// `-1` means "total unknown; this page is a prefilter" - the caller
    /// refines with `force_full = true`.
    pub total: i64,
    pub has_more: bool,
    pub search_time_ms: f64,
}

/// One scored row. `score` is "higher is better" in every mode (exact
/// stores the negated BM25 rank).
#[derive(Debug, Clone, Copy)]
pub struct Ranked {
    pub row_id: i64,
    pub score: f64,
    pub is_pinned: bool,
    pub last_used_at: f64,
}

/// Shared final ordering:
/// `is_pinned DESC, score DESC, last_used_at DESC, row_id ASC`.
/// The row_id tie-breaker makes paging stable.
pub(crate) fn sort_ranked(rows: &mut [Ranked]) {
    rows.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then_with(|| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.last_used_at
                    .partial_cmp(&a.last_used_at)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.row_id.cmp(&b.row_id))
    });
}

/// Incremental fuzzy-index updates pushed by the facade after each
/// committed write.
#[derive(Debug)]
pub enum IndexDelta {
    Upserted(IndexRow),
    Removed { id: String },
    PinChanged { id: String, pinned: bool },
    Touched { id: String, last_used_at: f64 },
    Cleared,
}

enum EngineCommand {
    Search {
        req: SearchRequest,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<SearchResultPage>>,
    },
    FetchRecent {
        limit: usize,
        offset: usize,
        filter: RecentFilter,
        reply: oneshot::Sender<Result<(Vec<ItemSummary>, bool)>>,
    },
    LoadItem {
        id: String,
        reply: oneshot::Sender<Result<Item>>,
    },
    Statistics {
        reply: oneshot::Sender<Result<Stats>>,
    },
    PlanCleanup {
        settings: Settings,
        reply: oneshot::Sender<Result<CleanupPlan>>,
    },
    StorageRefs {
        reply: oneshot::Sender<Result<std::collections::HashSet<std::path::PathBuf>>>,
    },
    ApplyDelta(IndexDelta),
    InvalidateCaches,
    UpdateSettings(Settings),
    Shutdown,
}

/// Handle to the engine thread.
pub struct SearchEngine {
    tx: mpsc::Sender<EngineCommand>,
    interrupt: rusqlite::InterruptHandle,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SearchEngine {
    /// Open the read-only connection and start the engine thread. A saved
    /// fuzzy index is validated and loaded lazily on the first fuzzy query.
    pub fn spawn(paths: DataPaths, settings: Settings) -> Result<Self> {
        let reader = StoreReader::open(&paths.db_path())?;
        let interrupt = reader.interrupt_handle();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let engine = Engine {
            reader,
            paths,
            settings,
            fuzzy: None,
            tried_cold_load: false,
            short_cache: ShortQueryCache::new(),
            paging: PagingCache::new(),
        };

        let handle = std::thread::Builder::new()
            .name("clipkeep-search".into())
            .spawn(move || run_engine(engine, rx))
            .map_err(|e| Error::Internal(format!("engine thread spawn: {e}")))?;

        Ok(Self {
            tx,
            interrupt,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Abort the SQL step currently executing on the read connection.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Internal("search engine gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("search engine dropped reply".into()))?
    }

    pub async fn search(
        &self,
        req: SearchRequest,
        cancel: CancellationToken,
    ) -> Result<SearchResultPage> {
        self.send(|reply| EngineCommand::Search { req, cancel, reply })
            .await
    }

    pub async fn fetch_recent(
        &self,
        limit: usize,
        offset: usize,
        filter: RecentFilter,
    ) -> Result<(Vec<ItemSummary>, bool)> {
        self.send(|reply| EngineCommand::FetchRecent {
            limit,
            offset,
            filter,
            reply,
        })
        .await
    }

    pub async fn load_item(&self, id: String) -> Result<Item> {
        self.send(|reply| EngineCommand::LoadItem { id, reply }).await
    }

    pub async fn statistics(&self) -> Result<Stats> {
        self.send(|reply| EngineCommand::Statistics { reply }).await
    }

    pub async fn plan_cleanup(&self, settings: Settings) -> Result<CleanupPlan> {
        self.send(|reply| EngineCommand::PlanCleanup { settings, reply })
            .await
    }

    pub async fn storage_refs(&self) -> Result<std::collections::HashSet<std::path::PathBuf>> {
        self.send(|reply| EngineCommand::StorageRefs { reply }).await
    }

    /// Queue an index delta. FIFO with queries, so a caller that awaited a
    /// write and then searches observes its own write.
    pub async fn apply_delta(&self, delta: IndexDelta) -> Result<()> {
        self.tx
            .send(EngineCommand::ApplyDelta(delta))
            .await
            .map_err(|_| Error::Internal("search engine gone".into()))
    }

    /// Post-cleanup: drop caches and mark the fuzzy index stale.
    pub async fn invalidate_caches(&self) -> Result<()> {
        self.tx
            .send(EngineCommand::InvalidateCaches)
            .await
            .map_err(|_| Error::Internal("search engine gone".into()))
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.tx
            .send(EngineCommand::UpdateSettings(settings))
            .await
            .map_err(|_| Error::Internal("search engine gone".into()))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown).await;
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        let _ = self.tx.try_send(EngineCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Engine thread
// ---------------------------------------------------------------------------

struct Engine {
    reader: StoreReader,
    paths: DataPaths,
    settings: Settings,
    fuzzy: Option<FuzzyIndex>,
    tried_cold_load: bool,
    short_cache: ShortQueryCache,
    paging: PagingCache,
}

fn run_engine(mut engine: Engine, mut rx: mpsc::Receiver<EngineCommand>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            EngineCommand::Search { req, cancel, reply } => {
                let _ = reply.send(engine.handle_search(req, &cancel));
            }
            EngineCommand::FetchRecent {
                limit,
                offset,
                filter,
                reply,
            } => {
                let _ = reply.send(engine.reader.fetch_recent(limit, offset, &filter));
            }
            EngineCommand::LoadItem { id, reply } => {
                let _ = reply.send(engine.reader.load_item(&id));
            }
            EngineCommand::Statistics { reply } => {
                let _ = reply.send(engine.reader.statistics());
            }
            EngineCommand::PlanCleanup { settings, reply } => {
                let _ = reply.send(plan_deletions(&engine.reader, &settings));
            }
            EngineCommand::StorageRefs { reply } => {
                let _ = reply.send(engine.reader.all_storage_refs());
            }
            EngineCommand::ApplyDelta(delta) => engine.apply_delta(delta),
            EngineCommand::InvalidateCaches => {
                engine.short_cache.invalidate();
                engine.paging.clear();
                if let Some(index) = engine.fuzzy.as_mut() {
                    index.mark_stale();
                }
            }
            EngineCommand::UpdateSettings(settings) => {
                if settings.short_query_cache_size != engine.settings.short_query_cache_size {
                    engine.short_cache.invalidate();
                }
                engine.settings = settings;
            }
            EngineCommand::Shutdown => break,
        }
    }
    tracing::debug!("search engine thread shutting down");
}

impl Engine {
    fn apply_delta(&mut self, delta: IndexDelta) {
        let Some(index) = self.fuzzy.as_mut() else {
            return; // built lazily; nothing to patch yet
        };
        match delta {
            IndexDelta::Upserted(row) => index.upsert(row),
            IndexDelta::Removed { id } => index.remove(&id),
            IndexDelta::PinChanged { id, pinned } => index.set_pinned(&id, pinned),
            IndexDelta::Touched { id, last_used_at } => index.touch(&id, last_used_at),
            IndexDelta::Cleared => index.clear(),
        }
        // Mark the index current for the seq this write committed under.
        if let Ok(seq) = self.reader.mutation_seq() {
            index.set_generation(seq);
        }
    }

    fn handle_search(
        &mut self,
        req: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        let start = Instant::now();
        if req.limit == 0 {
            return Err(Error::Internal("limit must be positive".into()));
        }

        // One read snapshot for the whole request: scoring and row
        // materialization cannot tear across a concurrent commit.
        self.reader.begin_read()?;
        let result = self.search_snapshot(&req, cancel);
        self.reader.end_read();

        let mut page = result?;
        page.search_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(page)
    }

    fn search_snapshot(
        &mut self,
        req: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        let query = normalize_query(&req.query);
        let filter = RecentFilter {
            app_bundle_id: req.app_filter.clone(),
            types: req.type_filter.clone(),
        }
        .normalized();
        let seq = self.reader.mutation_seq()?;

        match req.mode {
            SearchMode::Exact => self.search_exact(&query, &filter, req, seq, cancel),
            SearchMode::Fuzzy | SearchMode::FuzzyPlus => {
                self.search_fuzzy(req.mode, &query, &filter, req, seq, cancel)
            }
            SearchMode::Regex => self.search_regex(&query, &filter, req, seq, cancel),
        }
    }

    // -- exact ------------------------------------------------------------

    fn search_exact(
        &mut self,
        query: &str,
        filter: &RecentFilter,
        req: &SearchRequest,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        if query.is_empty() {
            return self.recent_page(req, filter);
        }

        let char_len = query.chars().count();
        if char_len <= self.settings.short_query_limit {
            if req.force_full {
                // FTS tokens cannot express a 1-2 char substring; refine
                // with a full table scan instead.
                let key = self.page_key(SearchMode::Exact, query.to_lowercase(), filter, req, seq);
                if let Some(result) = self.paging.get(&key) {
                    return self.page_from(&result, req);
                }
                let mut rows = fts::substring_scan(
                    self.reader.connection(),
                    &query.to_lowercase(),
                    filter,
                    cancel,
                )?;
                sort_ranked(&mut rows);
                let total = rows.len() as i64;
                let result = Arc::new(ResultList { rows, total });
                self.paging.put(key, result.clone());
                return self.page_from(&result, req);
            }
            return self.short_query_page(query, filter, req, seq, cancel);
        }

        let key = self.page_key(SearchMode::Exact, query.to_lowercase(), filter, req, seq);
        if let Some(result) = self.paging.get(&key) {
            return self.page_from(&result, req);
        }

        let Some(match_expr) = fts::build_match_expr(query) else {
            return self.recent_page(req, filter);
        };
        let mut rows = fts::fts_query(self.reader.connection(), &match_expr, filter, None, cancel)?;
        sort_ranked(&mut rows);
        let total = rows.len() as i64;
        let result = Arc::new(ResultList { rows, total });
        self.paging.put(key, result.clone());
        self.page_from(&result, req)
    }

    /// Short queries search only the most-recent-N mirror and say so with
    /// `total = -1`.
    fn short_query_page(
        &mut self,
        query: &str,
        filter: &RecentFilter,
        req: &SearchRequest,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        self.ensure_short_cache(seq)?;
        let needle = query.to_lowercase();

        let mut rows: Vec<Ranked> = Vec::new();
        for (n, item) in self.short_cache.items().iter().enumerate() {
            if n % SCORE_CANCEL_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if item.matches_filter(filter) && item.text_lower.contains(&needle) {
                rows.push(Ranked {
                    row_id: item.row_id,
                    score: 0.0,
                    is_pinned: item.is_pinned,
                    last_used_at: item.last_used_at,
                });
            }
        }
        sort_ranked(&mut rows);

        // More candidates may exist beyond the mirror; stay honest.
        let beyond_mirror =
            self.reader.statistics()?.item_count as usize > self.short_cache.len();
        let has_more = req.offset + req.limit < rows.len() || beyond_mirror;
        let mut page = self.page_from(&ResultList { rows, total: -1 }, req)?;
        page.has_more = has_more;
        Ok(page)
    }

    // -- fuzzy / fuzzy_plus ----------------------------------------------

    fn search_fuzzy(
        &mut self,
        mode: SearchMode,
        query: &str,
        filter: &RecentFilter,
        req: &SearchRequest,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        if query.is_empty() {
            return self.recent_page(req, filter);
        }

        let query_lower = query.to_lowercase();
        let key = self.page_key(mode, query_lower.clone(), filter, req, seq);
        if let Some(result) = self.paging.get(&key) {
            return self.page_from(&result, req);
        }

        self.ensure_fuzzy_index(seq, cancel)?;
        let index = self.fuzzy.as_ref().expect("index ensured above");

        let candidates = index.candidates(&query_lower);
        let is_prefilter = !req.force_full && candidates.len() >= LARGE_CANDIDATE_THRESHOLD;

        let mut rows = if is_prefilter {
            let multi_word_ascii =
                query_lower.is_ascii() && query_lower.split_whitespace().count() >= 2;
            if multi_word_ascii {
                // High-recall screen via FTS; full scoring happens on the
                // force_full refine.
                let match_expr = fts::build_match_expr(query)
                    .unwrap_or_else(|| format!("\"{}\"", query.replace('"', "\"\"")));
                fts::fts_query(
                    self.reader.connection(),
                    &match_expr,
                    filter,
                    Some(PREFILTER_FTS_LIMIT),
                    cancel,
                )?
            } else {
                // Score only the most recently used candidates.
                let mut by_recency: Vec<u32> = candidates.clone();
                by_recency.sort_by(|&a, &b| {
                    let ta = index.get(a).map(|i| i.last_used_at).unwrap_or(0.0);
                    let tb = index.get(b).map(|i| i.last_used_at).unwrap_or(0.0);
                    tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
                });
                by_recency.truncate(PREFILTER_RECENT_LIMIT);
                score_candidates(index, &by_recency, mode, &query_lower, filter, cancel)?
            }
        } else {
            score_candidates(index, &candidates, mode, &query_lower, filter, cancel)?
        };

        sort_ranked(&mut rows);
        let total = if is_prefilter { -1 } else { rows.len() as i64 };
        let result = Arc::new(ResultList { rows, total });
        self.paging.put(key, result.clone());

        let mut page = self.page_from(&result, req)?;
        if is_prefilter {
            // The full candidate set is larger than anything we scored.
            page.has_more = true;
        }
        Ok(page)
    }

    /// Make the fuzzy index usable: cold-load once, rebuild on generation
    /// drift, compact when tombstones pass the threshold.
    fn ensure_fuzzy_index(&mut self, seq: u64, cancel: &CancellationToken) -> Result<()> {
        if self.fuzzy.is_none() && !self.tried_cold_load {
            self.tried_cold_load = true;
            let fingerprint = DbFingerprint::capture(&self.paths.db_path());
            if let Some(index) = FuzzyIndex::load(
                &self.paths.index_path(),
                &self.paths.index_sidecar_path(),
                &fingerprint,
                seq,
            ) {
                tracing::info!(items = index.live_count(), "loaded fuzzy index from disk");
                self.fuzzy = Some(index);
            }
        }

        let rebuild = match &self.fuzzy {
            None => true,
            // Change-token mismatch: an external write or a missed event.
            // Never silently serve stale results.
            Some(index) => index.generation() != seq,
        };

        if rebuild {
            let mut index = FuzzyIndex::new(seq);
            let completed = self.reader.stream_index_rows(|row| {
                if cancel.is_cancelled() {
                    return false;
                }
                index.upsert(row);
                true
            })?;
            if !completed {
                // Cancelled mid-build: install nothing.
                return Err(Error::Cancelled);
            }

            let fingerprint = DbFingerprint::capture(&self.paths.db_path());
            if let Err(e) = index.save(
                &self.paths.index_path(),
                &self.paths.index_sidecar_path(),
                fingerprint,
            ) {
                tracing::warn!("fuzzy index save failed: {e}");
            }
            tracing::info!(items = index.live_count(), "rebuilt fuzzy index");
            self.fuzzy = Some(index);
        } else if let Some(index) = self.fuzzy.as_mut() {
            if index.needs_compaction() {
                index.compact();
            }
        }

        Ok(())
    }

    // -- regex ------------------------------------------------------------

    /// Regex runs over the short-query cache only (scope documented in the
    /// settings surface); the result is a prefilter by construction.
    fn search_regex(
        &mut self,
        query: &str,
        filter: &RecentFilter,
        req: &SearchRequest,
        seq: u64,
        cancel: &CancellationToken,
    ) -> Result<SearchResultPage> {
        let regex = regex::RegexBuilder::new(query)
            .size_limit(1 << 20)
            .build()
            .map_err(|e| Error::RegexCompile(e.to_string()))?;

        self.ensure_short_cache(seq)?;
        let start = Instant::now();

        let mut rows: Vec<Ranked> = Vec::new();
        for (n, item) in self.short_cache.items().iter().enumerate() {
            if n % 64 == 0 {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if start.elapsed() > DEFAULT_DEADLINE {
                    return Err(Error::Timeout);
                }
            }
            if item.matches_filter(filter) && regex.is_match(&item.text) {
                rows.push(Ranked {
                    row_id: item.row_id,
                    score: 0.0,
                    is_pinned: item.is_pinned,
                    last_used_at: item.last_used_at,
                });
            }
        }
        sort_ranked(&mut rows);

        let beyond_mirror =
            self.reader.statistics()?.item_count as usize > self.short_cache.len();
        let has_more = req.offset + req.limit < rows.len() || beyond_mirror;
        let mut page = self.page_from(&ResultList { rows, total: -1 }, req)?;
        page.has_more = has_more;
        Ok(page)
    }

    // -- shared helpers ---------------------------------------------------

    fn ensure_short_cache(&mut self, seq: u64) -> Result<()> {
        if self.short_cache.is_fresh(seq) {
            return Ok(());
        }
        let rows = self
            .reader
            .fetch_cache_rows(self.settings.short_query_cache_size)?;
        let items = rows.into_iter().map(CachedItem::from_row).collect();
        self.short_cache.replace(items, seq);
        Ok(())
    }

    fn recent_page(&self, req: &SearchRequest, filter: &RecentFilter) -> Result<SearchResultPage> {
        let (items, has_more) = self.reader.fetch_recent(req.limit, req.offset, filter)?;
        let total = if filter.is_empty() {
            self.reader.statistics()?.item_count as i64
        } else {
            -1
        };
        Ok(SearchResultPage {
            items,
            total,
            has_more,
            search_time_ms: 0.0,
        })
    }

    fn page_key(
        &self,
        mode: SearchMode,
        query: String,
        filter: &RecentFilter,
        req: &SearchRequest,
        seq: u64,
    ) -> PageKey {
        PageKey {
            mode,
            query,
            app_bundle_id: filter.app_bundle_id.clone(),
            types: filter.types.clone(),
            force_full: req.force_full,
            generation: seq,
        }
    }

    fn page_from(&self, result: &ResultList, req: &SearchRequest) -> Result<SearchResultPage> {
        let rows = &result.rows;
        let start = req.offset.min(rows.len());
        let end = (req.offset + req.limit).min(rows.len());
        let row_ids: Vec<i64> = rows[start..end].iter().map(|r| r.row_id).collect();
        let items = self.reader.fetch_by_row_ids(&row_ids)?;
        Ok(SearchResultPage {
            items,
            total: result.total,
            has_more: req.offset + req.limit < rows.len(),
            search_time_ms: 0.0,
        })
    }
}

fn score_candidates(
    index: &FuzzyIndex,
    candidates: &[u32],
    mode: SearchMode,
    query_lower: &str,
    filter: &RecentFilter,
    cancel: &CancellationToken,
) -> Result<Vec<Ranked>> {
    let mut rows = Vec::new();
    for (n, &slot) in candidates.iter().enumerate() {
        if n % SCORE_CANCEL_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(item) = index.get(slot) else { continue };

        if let Some(app) = &filter.app_bundle_id {
            if item.app_bundle_id.as_deref() != Some(app.as_str()) {
                continue;
            }
        }
        if let Some(types) = &filter.types {
            if !types.contains(&item.item_type) {
                continue;
            }
        }

        let score = match mode {
            SearchMode::Fuzzy => fuzzy::fuzzy_score(&item.text_lower, query_lower),
            SearchMode::FuzzyPlus => fuzzy::fuzzy_plus_score(&item.text_lower, query_lower),
            _ => unreachable!("score_candidates is fuzzy-only"),
        };
        if let Some(score) = score {
            rows.push(Ranked {
                row_id: item.row_id,
                score,
                is_pinned: item.is_pinned,
                last_used_at: item.last_used_at,
            });
        }
    }
    Ok(rows)
}

/// NFC-normalize and trim a query so NFD input finds NFC-indexed text.
fn normalize_query(query: &str) -> String {
    query.nfc().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_roundtrip() {
        for mode in [
            SearchMode::Exact,
            SearchMode::Fuzzy,
            SearchMode::FuzzyPlus,
            SearchMode::Regex,
        ] {
            assert_eq!(SearchMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(SearchMode::parse("bm25"), None);
    }

    #[test]
    fn ranked_sort_order_is_pinned_score_recency_rowid() {
        let mut rows = vec![
            Ranked { row_id: 4, score: 9.0, is_pinned: false, last_used_at: 4.0 },
            Ranked { row_id: 3, score: 1.0, is_pinned: true, last_used_at: 1.0 },
            Ranked { row_id: 2, score: 5.0, is_pinned: false, last_used_at: 9.0 },
            Ranked { row_id: 1, score: 5.0, is_pinned: false, last_used_at: 9.0 },
        ];
        sort_ranked(&mut rows);
        let ids: Vec<i64> = rows.iter().map(|r| r.row_id).collect();
        // Pinned first, then score, then recency, row_id breaking the tie.
        assert_eq!(ids, vec![3, 4, 1, 2]);
    }

    #[test]
    fn query_normalization_folds_nfd_to_nfc() {
        // "é" as NFD (e + combining acute) must equal the NFC form.
        let nfd = "cafe\u{0301}";
        let nfc = "caf\u{00e9}";
        assert_eq!(normalize_query(nfd), normalize_query(nfc));
        assert_eq!(normalize_query("  padded  "), "padded");
    }
}
