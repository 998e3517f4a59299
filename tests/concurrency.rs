//! Concurrency contracts: atomic snapshots, bounded waits, cancel safety.

use clipkeep::config::{DataPaths, MemorySettingsStore, Settings};
use clipkeep::ingest::RawCapture;
use clipkeep::pasteboard::NullPasteboard;
use clipkeep::search::{SearchMode, SearchRequest};
use clipkeep::service::{ClipboardService, ServiceOptions};
use clipkeep::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

async fn service() -> (tempfile::TempDir, Arc<ClipboardService>) {
    let dir = tempfile::tempdir().unwrap();
    let service = ClipboardService::start(ServiceOptions {
        paths: DataPaths::new(dir.path()),
        settings_store: Arc::new(MemorySettingsStore::new(Settings::default())),
        pasteboard: Arc::new(NullPasteboard::default()),
    })
    .await
    .unwrap();
    (dir, Arc::new(service))
}

fn text(t: &str) -> RawCapture {
    RawCapture::Text {
        text: t.to_string(),
        app_bundle_id: None,
    }
}

/// A search racing a clear_all sees either the pre-clear corpus or the
/// post-clear emptiness (or a cancellation) - never a mixture.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn search_racing_clear_is_atomic() {
    let (_dir, service) = service().await;

    const N: usize = 400;
    for i in 0..N {
        service
            .ingest_at(text(&format!("racer {i}")), i as f64)
            .await
            .unwrap();
    }
    // Warm the fuzzy index so the racing search exercises the index path.
    service
        .search(SearchRequest::new("racer", SearchMode::FuzzyPlus))
        .await
        .unwrap();

    let searcher = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .search(SearchRequest {
                    limit: N,
                    ..SearchRequest::new("racer", SearchMode::FuzzyPlus)
                })
                .await
        })
    };
    let clearer = {
        let service = service.clone();
        tokio::spawn(async move { service.clear_all(false).await })
    };

    let search_result = searcher.await.unwrap();
    clearer.await.unwrap().unwrap();

    match search_result {
        Ok(page) => {
            assert!(
                page.items.len() == N || page.items.is_empty(),
                "saw a torn result: {} of {N} items",
                page.items.len()
            );
        }
        Err(Error::Cancelled) | Err(Error::Timeout) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }

    service.stop().await;
}

/// A reader completes within a bounded wait while an external writer holds
/// the database. WAL keeps readers off the writer's lock entirely.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reader_is_not_blocked_by_busy_writer() {
    let (dir, service) = service().await;
    for i in 0..50 {
        service
            .ingest_at(text(&format!("entry {i}")), i as f64)
            .await
            .unwrap();
    }

    // Hold a write transaction on a separate connection for ~100 ms.
    let db_path = dir.path().join("clipboard.db");
    let holder = tokio::task::spawn_blocking(move || {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.execute_batch("PRAGMA busy_timeout=5000;").unwrap();
        conn.execute_batch("BEGIN IMMEDIATE;").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        conn.execute_batch("COMMIT;").unwrap();
    });

    let start = Instant::now();
    let page = service
        .search(SearchRequest::new("entry", SearchMode::Exact))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 50);
    assert!(
        start.elapsed() < Duration::from_millis(2000),
        "reader waited {:?}",
        start.elapsed()
    );

    holder.await.unwrap();
    service.stop().await;
}

/// A cancelled search surfaces `Cancelled` and leaves subsequent queries
/// (and their caches) consistent.
#[tokio::test]
async fn cancelled_search_leaves_caches_consistent() {
    let (_dir, service) = service().await;
    for i in 0..20 {
        service
            .ingest_at(text(&format!("stable {i}")), i as f64)
            .await
            .unwrap();
    }

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let result = service
        .search_with_cancel(
            SearchRequest::new("stable", SearchMode::FuzzyPlus),
            cancelled,
        )
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));

    // The same query still computes the full, correct answer afterwards.
    let page = service
        .search(SearchRequest {
            limit: 30,
            ..SearchRequest::new("stable", SearchMode::FuzzyPlus)
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 20);
    assert_eq!(page.total, 20);

    service.stop().await;
}

/// Writes enqueued concurrently serialize FIFO: every one lands, and dedup
/// counting stays exact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingests_serialize_without_loss() {
    let (_dir, service) = service().await;

    let mut handles = Vec::new();
    for round in 0..4 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                // Every round ingests the same 25 texts.
                service
                    .ingest_at(
                        text(&format!("shared payload {i}")),
                        (round * 100 + i) as f64,
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.item_count, 25);

    let (items, _) = service
        .fetch_recent(50, 0, clipkeep::store::RecentFilter::default())
        .await
        .unwrap();
    assert!(items.iter().all(|i| i.use_count == 4));

    service.stop().await;
}
