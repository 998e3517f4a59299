//! End-to-end scenarios against a real service on a throwaway data root.

use clipkeep::config::{DataPaths, MemorySettingsStore, Settings};
use clipkeep::ingest::RawCapture;
use clipkeep::pasteboard::NullPasteboard;
use clipkeep::search::{SearchMode, SearchRequest};
use clipkeep::service::{ClipboardService, ServiceOptions};
use clipkeep::store::RecentFilter;
use std::sync::Arc;

async fn service_with(settings: Settings) -> (tempfile::TempDir, ClipboardService) {
    let dir = tempfile::tempdir().unwrap();
    let service = ClipboardService::start(ServiceOptions {
        paths: DataPaths::new(dir.path()),
        settings_store: Arc::new(MemorySettingsStore::new(settings)),
        pasteboard: Arc::new(NullPasteboard::default()),
    })
    .await
    .unwrap();
    (dir, service)
}

async fn service() -> (tempfile::TempDir, ClipboardService) {
    service_with(Settings::default()).await
}

fn text(t: &str) -> RawCapture {
    RawCapture::Text {
        text: t.to_string(),
        app_bundle_id: None,
    }
}

fn request(query: &str, mode: SearchMode) -> SearchRequest {
    SearchRequest::new(query, mode)
}

/// S1 - dedup: same text twice collapses to one item with use_count 2 and
/// the newest timestamp.
#[tokio::test]
async fn s1_dedup_collapses_to_one_item() -> anyhow::Result<()> {
    let (_dir, service) = service().await;

    service.ingest_at(text("hello world"), 100.0).await?;
    service.ingest_at(text("hello world"), 200.0).await?;

    let (items, _) = service.fetch_recent(10, 0, RecentFilter::default()).await?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].use_count, 2);
    assert_eq!(items[0].last_used_at, 200.0);

    service.stop().await;
    Ok(())
}

/// S2 - pinned precedence: the pinned item leads even though it is older.
#[tokio::test]
async fn s2_pinned_precedes_newer_items() {
    let (_dir, service) = service().await;

    service.ingest_at(text("item A"), 100.0).await.unwrap();
    service.ingest_at(text("item B"), 200.0).await.unwrap();

    let (items, _) = service
        .fetch_recent(10, 0, RecentFilter::default())
        .await
        .unwrap();
    let a_id = items.iter().find(|i| i.preview == "item A").unwrap().id.clone();
    service.pin(&a_id).await.unwrap();

    let page = service
        .search(request("", SearchMode::FuzzyPlus))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].preview, "item A");
    assert!(page.items[0].is_pinned);
    assert_eq!(page.items[1].preview, "item B");

    service.stop().await;
}

/// S3 - fuzzy_plus requires a contiguous substring for ASCII tokens; plain
/// fuzzy accepts the scattered subsequence too.
#[tokio::test]
async fn s3_fuzzy_plus_contiguity() {
    let (_dir, service) = service().await;

    service.ingest_at(text("foobar baz"), 1.0).await.unwrap();
    service.ingest_at(text("f_o_o_b_a_r baz"), 2.0).await.unwrap();

    let strict = service
        .search(request("foobar", SearchMode::FuzzyPlus))
        .await
        .unwrap();
    assert_eq!(strict.items.len(), 1);
    assert_eq!(strict.items[0].preview, "foobar baz");

    let loose = service
        .search(request("foobar", SearchMode::Fuzzy))
        .await
        .unwrap();
    assert_eq!(loose.items.len(), 2);
    // Contiguous match scores higher.
    assert_eq!(loose.items[0].preview, "foobar baz");

    service.stop().await;
}

/// S4 - progressive refine: a hot short query answers with a prefilter
/// (`total = -1`), and the force_full refine is a superset in the right
/// order.
#[tokio::test]
async fn s4_progressive_refine() {
    let (_dir, service) = service().await;

    // Enough matching items to cross the large-candidate threshold (6000).
    const N: usize = 6500;
    for i in 0..N {
        service
            .ingest_at(text(&format!("cm item {i}")), i as f64)
            .await
            .unwrap();
    }

    let prefilter = service
        .search(SearchRequest {
            limit: 50,
            ..request("cm", SearchMode::FuzzyPlus)
        })
        .await
        .unwrap();
    assert_eq!(prefilter.total, -1);
    assert!(prefilter.has_more);
    assert_eq!(prefilter.items.len(), 50);

    // First 200 prefilter row_ids via paging (slices of the cached list).
    let mut prefilter_ids = Vec::new();
    for page in 0..4 {
        let p = service
            .search(SearchRequest {
                limit: 50,
                offset: page * 50,
                ..request("cm", SearchMode::FuzzyPlus)
            })
            .await
            .unwrap();
        prefilter_ids.extend(p.items.iter().map(|i| i.row_id));
    }

    let full = service
        .search(SearchRequest {
            limit: 50,
            force_full: true,
            ..request("cm", SearchMode::FuzzyPlus)
        })
        .await
        .unwrap();
    assert!(full.total >= N as i64);
    assert!(full.has_more);

    // The refined first page is contained in the prefilter's first 200.
    for item in &full.items {
        assert!(
            prefilter_ids.contains(&item.row_id),
            "row {} missing from prefilter screen",
            item.row_id
        );
    }

    service.stop().await;
}

/// S5 - pinning invalidates the short-query cache within one query.
#[tokio::test]
async fn s5_pin_refreshes_short_query_results() {
    let (_dir, service) = service().await;

    for i in 0..10 {
        service
            .ingest_at(text(&format!("a{i} entry")), i as f64)
            .await
            .unwrap();
    }

    // Short query (1 char): served from the recent-items mirror.
    let before = service
        .search(SearchRequest {
            limit: 10,
            ..request("a", SearchMode::Exact)
        })
        .await
        .unwrap();
    assert_eq!(before.total, -1);
    assert!(!before.items[0].is_pinned);

    // Pin the oldest item, then repeat the identical query.
    let oldest = before.items.last().unwrap().id.clone();
    service.pin(&oldest).await.unwrap();

    let after = service
        .search(SearchRequest {
            limit: 10,
            ..request("a", SearchMode::Exact)
        })
        .await
        .unwrap();
    assert_eq!(after.items[0].id, oldest);
    assert!(after.items[0].is_pinned);

    service.stop().await;
}

/// S6 - cleanup enforces the item cap, keeping the most recently used, and
/// the FTS index stays in lockstep.
#[tokio::test]
async fn s6_cleanup_under_item_cap() -> anyhow::Result<()> {
    let mut settings = Settings::default();
    settings.max_items = 100;
    let (dir, service) = service_with(settings).await;

    for i in 0..1000 {
        service
            .ingest_at(text(&format!("entry number {i}")), i as f64)
            .await?;
    }

    let report = service.run_cleanup().await?;
    assert_eq!(report.deleted_items, 900);

    let stats = service.get_stats().await?;
    assert_eq!(stats.item_count, 100);

    // Survivors are the 100 with the largest last_used_at.
    let (items, _) = service.fetch_recent(200, 0, RecentFilter::default()).await?;
    assert_eq!(items.len(), 100);
    assert!(items.iter().all(|i| i.last_used_at >= 900.0));

    service.stop().await;

    // FTS row count equals items row count after the batch delete.
    let conn = rusqlite::Connection::open(dir.path().join("clipboard.db"))?;
    let items_count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?;
    let fts_count: i64 = conn.query_row("SELECT COUNT(*) FROM items_fts", [], |r| r.get(0))?;
    assert_eq!(items_count, 100);
    assert_eq!(fts_count, items_count);
    Ok(())
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_exact_query_lists_recent() {
    let (_dir, service) = service().await;
    service.ingest_at(text("one"), 1.0).await.unwrap();
    service.ingest_at(text("two"), 2.0).await.unwrap();

    let page = service.search(request("", SearchMode::Exact)).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].preview, "two");
    assert_eq!(page.items[1].preview, "one");

    service.stop().await;
}

#[tokio::test]
async fn query_longer_than_any_text_returns_empty() {
    let (_dir, service) = service().await;
    service.ingest_at(text("short"), 1.0).await.unwrap();

    let long_query = "x".repeat(500);
    for mode in [SearchMode::Exact, SearchMode::Fuzzy, SearchMode::FuzzyPlus] {
        let page = service.search(request(&long_query, mode)).await.unwrap();
        assert!(page.items.is_empty(), "mode {mode:?} should find nothing");
    }

    service.stop().await;
}

#[tokio::test]
async fn deleting_last_item_leaves_working_fuzzy_search() {
    let (_dir, service) = service().await;
    service.ingest_at(text("only item"), 1.0).await.unwrap();

    // Warm the fuzzy index, then empty the store.
    let page = service
        .search(request("only", SearchMode::FuzzyPlus))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let id = page.items[0].id.clone();
    service.delete(&id).await.unwrap();

    let page = service
        .search(request("only", SearchMode::FuzzyPlus))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);

    service.stop().await;
}

#[tokio::test]
async fn nfd_and_nfc_queries_find_the_same_item() {
    let (_dir, service) = service().await;
    // Stored NFC.
    service.ingest_at(text("caf\u{00e9} menu"), 1.0).await.unwrap();

    // Queried NFD.
    let nfd = "cafe\u{0301}";
    let exact = service.search(request(nfd, SearchMode::Exact)).await.unwrap();
    assert_eq!(exact.items.len(), 1);

    let fuzzy = service
        .search(request(nfd, SearchMode::FuzzyPlus))
        .await
        .unwrap();
    assert_eq!(fuzzy.items.len(), 1);

    // And the NFD spelling of the same text dedups instead of duplicating.
    let outcome = service
        .ingest_at(text("cafe\u{0301} menu"), 2.0)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        clipkeep::ingest::IngestOutcome::Deduplicated(_)
    ));

    service.stop().await;
}

#[tokio::test]
async fn regex_mode_matches_and_rejects_bad_patterns() {
    let (_dir, service) = service().await;
    service.ingest_at(text("version 1.2.3 released"), 1.0).await.unwrap();
    service.ingest_at(text("no digits here"), 2.0).await.unwrap();

    let page = service
        .search(request(r"\d+\.\d+\.\d+", SearchMode::Regex))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.total, -1); // regex is cache-scoped, always a prefilter

    let err = service.search(request(r"[unclosed", SearchMode::Regex)).await;
    assert!(matches!(err, Err(clipkeep::Error::RegexCompile(_))));

    service.stop().await;
}

// ---------------------------------------------------------------------------
// Universal properties
// ---------------------------------------------------------------------------

/// Paging stability: pages concatenated in offset order are a prefix of the
/// full ordered result.
#[tokio::test]
async fn paging_is_stable_across_offsets() {
    let (_dir, service) = service().await;
    for i in 0..40 {
        service
            .ingest_at(text(&format!("paging target {i}")), i as f64)
            .await
            .unwrap();
    }

    let full = service
        .search(SearchRequest {
            limit: 40,
            ..request("paging target", SearchMode::Exact)
        })
        .await
        .unwrap();
    assert_eq!(full.items.len(), 40);

    let mut paged = Vec::new();
    for page in 0..4 {
        let p = service
            .search(SearchRequest {
                limit: 10,
                offset: page * 10,
                ..request("paging target", SearchMode::Exact)
            })
            .await
            .unwrap();
        paged.extend(p.items.iter().map(|i| i.row_id).collect::<Vec<_>>());
    }

    let full_ids: Vec<i64> = full.items.iter().map(|i| i.row_id).collect();
    assert_eq!(paged, full_ids);

    service.stop().await;
}

/// FTS / fuzzy subsumption: an ASCII token of length >= 3 present verbatim
/// is found by both exact and fuzzy_plus on the first page.
#[tokio::test]
async fn verbatim_token_found_by_exact_and_fuzzy_plus() {
    let (_dir, service) = service().await;
    service
        .ingest_at(text("the zanzibar protocol draft"), 1.0)
        .await
        .unwrap();

    for mode in [SearchMode::Exact, SearchMode::FuzzyPlus] {
        let page = service.search(request("zanzibar", mode)).await.unwrap();
        assert_eq!(page.items.len(), 1, "mode {mode:?}");
        assert!(page.items[0].preview.contains("zanzibar"));
    }

    service.stop().await;
}

/// Mutation-seq monotonicity observed through the meta table.
#[tokio::test]
async fn mutation_seq_increases_across_writes() {
    let (dir, service) = service().await;

    service.ingest_at(text("first"), 1.0).await.unwrap();
    service.ingest_at(text("second"), 2.0).await.unwrap();
    let (items, _) = service
        .fetch_recent(1, 0, RecentFilter::default())
        .await
        .unwrap();
    service.pin(&items[0].id).await.unwrap();
    service.stop().await;

    let conn = rusqlite::Connection::open(dir.path().join("clipboard.db")).unwrap();
    let seq: i64 = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'mutation_seq'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(seq, 3);
}

/// External-blob consistency: live refs exist on disk; orphans are
/// reclaimed within one sweep.
#[tokio::test]
async fn external_blob_consistency() {
    let (_dir, service) = service().await;

    // Externalized payload (over the 100 KiB threshold).
    let big = vec![0x42u8; 150 * 1024];
    service
        .ingest(RawCapture::Image {
            data: big,
            caption: Some("screenshot".into()),
            app_bundle_id: None,
        })
        .await
        .unwrap();

    let (items, _) = service
        .fetch_recent(1, 0, RecentFilter::default())
        .await
        .unwrap();
    assert!(items[0].has_external);
    let preview = service.load_preview_data(&items[0].id).await.unwrap();
    assert_eq!(preview.unwrap().len(), 150 * 1024);

    // Delete the item: its blob goes with it, and a sweep finds nothing.
    service.delete(&items[0].id).await.unwrap();
    assert_eq!(service.sweep_orphans().await.unwrap(), 0);

    service.stop().await;
}

#[tokio::test]
async fn clear_all_keep_pinned_spares_pins() {
    let (_dir, service) = service().await;
    service.ingest_at(text("pin me"), 1.0).await.unwrap();
    service.ingest_at(text("clear me"), 2.0).await.unwrap();

    let (items, _) = service
        .fetch_recent(10, 0, RecentFilter::default())
        .await
        .unwrap();
    let pinned = items.iter().find(|i| i.preview == "pin me").unwrap().id.clone();
    service.pin(&pinned).await.unwrap();

    service.clear_all(true).await.unwrap();

    let (survivors, _) = service
        .fetch_recent(10, 0, RecentFilter::default())
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].preview, "pin me");

    // Search still agrees after the index rebuild.
    let page = service.search(request("pin", SearchMode::FuzzyPlus)).await.unwrap();
    assert_eq!(page.items.len(), 1);

    service.stop().await;
}
