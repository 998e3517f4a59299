//! Service facade
//!
//! Single entry point for the UI and the CLI. Owns the writer, the search
//! engine, the file store, the ingest pipeline, the cleanup scheduler and
//! the event bus; nothing else in the process touches a DB handle.
//!
//! `start` follows a staging pattern: every resource is acquired into a
//! local first and the facade is assembled in one move at the end, so a
//! partial failure unwinds the locals and leaves a clean not-started state.
//!
//! Once the store reports corruption the facade latches: further writes are
//! refused and a terminal `CorruptDetected` event is published. The UI
//! collaborator owns the rebuild conversation.

use crate::cleanup::{reclaim_blobs, CleanupReport, CleanupScheduler};
use crate::config::{DataPaths, Settings, SettingsStore};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::filestore::FileStore;
use crate::ingest::{IngestOutcome, IngestPipeline, RawCapture};
use crate::pasteboard::Pasteboard;
use crate::search::{
    IndexDelta, SearchEngine, SearchRequest, SearchResultPage, DEFAULT_DEADLINE,
    FIRST_BUILD_DEADLINE, SearchMode,
};
use crate::store::{open_and_migrate, ItemSummary, ItemType, RecentFilter, Stats, StoreWriter};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Delay before the startup orphan sweep.
const SWEEP_STARTUP_DELAY: Duration = Duration::from_secs(30);

/// Everything the facade needs from its environment.
pub struct ServiceOptions {
    pub paths: DataPaths,
    pub settings_store: Arc<dyn SettingsStore>,
    pub pasteboard: Arc<dyn Pasteboard>,
}

pub struct ClipboardService {
    paths: DataPaths,
    settings: Arc<RwLock<Settings>>,
    settings_store: Arc<dyn SettingsStore>,
    pasteboard: Arc<dyn Pasteboard>,
    writer: Arc<StoreWriter>,
    engine: Arc<SearchEngine>,
    files: Arc<FileStore>,
    bus: EventBus,
    ingest: IngestPipeline,
    cleanup: Arc<CleanupScheduler>,
    corrupt: AtomicBool,
    fuzzy_warmed: AtomicBool,
    sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClipboardService {
    /// Acquire every resource, then commit to a running facade in one step.
    pub async fn start(options: ServiceOptions) -> Result<Self> {
        let settings = options.settings_store.load()?;

        let files = Arc::new(FileStore::open(&options.paths)?);
        files.clear_spool();

        let conn = open_and_migrate(&options.paths.db_path()).map_err(|e| match e {
            Error::DbOpen(_) | Error::DbCorrupt(_) | Error::IoFailed(_) | Error::DiskFull => e,
            other => Error::DbOpen(other.to_string()),
        })?;
        let bus = EventBus::default();
        let writer = Arc::new(StoreWriter::spawn(conn, bus.clone())?);
        let engine = Arc::new(SearchEngine::spawn(options.paths.clone(), settings.clone())?);

        let settings = Arc::new(RwLock::new(settings));
        let ingest = IngestPipeline::spawn(
            writer.clone(),
            engine.clone(),
            files.clone(),
            settings.clone(),
        );
        let cleanup = Arc::new(CleanupScheduler::new(
            writer.clone(),
            engine.clone(),
            files.clone(),
            options.paths.clone(),
        ));

        // Deferred startup sweep, then at most hourly.
        let sweep_task = {
            let cleanup = cleanup.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SWEEP_STARTUP_DELAY).await;
                loop {
                    if let Err(e) = cleanup.orphan_sweep(false).await {
                        tracing::warn!("orphan sweep failed: {e}");
                    }
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            })
        };

        Ok(Self {
            paths: options.paths,
            settings,
            settings_store: options.settings_store,
            pasteboard: options.pasteboard,
            writer,
            engine,
            files,
            bus,
            ingest,
            cleanup,
            corrupt: AtomicBool::new(false),
            fuzzy_warmed: AtomicBool::new(false),
            sweep_task: Mutex::new(Some(sweep_task)),
        })
    }

    /// Release everything: ingest drains, actors join, connections close
    /// (their statement caches go first, by drop order inside each actor).
    pub async fn stop(&self) {
        if let Some(task) = self.sweep_task.lock().unwrap().take() {
            task.abort();
        }
        self.ingest.shutdown().await;
        self.engine.shutdown().await;
        self.writer.shutdown().await;
    }

    pub fn data_paths(&self) -> &DataPaths {
        &self.paths
    }

    // -- reads ------------------------------------------------------------

    pub async fn fetch_recent(
        &self,
        limit: usize,
        offset: usize,
        filter: RecentFilter,
    ) -> Result<(Vec<ItemSummary>, bool)> {
        self.engine.fetch_recent(limit, offset, filter).await
    }

    pub async fn search(&self, req: SearchRequest) -> Result<SearchResultPage> {
        self.search_with_cancel(req, CancellationToken::new()).await
    }

    /// Search under a caller-owned cancellation token. Timeout or upstream
    /// cancel interrupts the read connection; the engine leaves its caches
    /// untouched on that path.
    pub async fn search_with_cancel(
        &self,
        req: SearchRequest,
        cancel: CancellationToken,
    ) -> Result<SearchResultPage> {
        let fuzzy = matches!(req.mode, SearchMode::Fuzzy | SearchMode::FuzzyPlus);
        let deadline = if fuzzy && !self.fuzzy_warmed.load(Ordering::Relaxed) {
            FIRST_BUILD_DEADLINE
        } else {
            DEFAULT_DEADLINE
        };

        let result = tokio::time::timeout(deadline, self.engine.search(req, cancel.clone())).await;
        match result {
            Ok(page) => {
                if fuzzy && page.is_ok() {
                    self.fuzzy_warmed.store(true, Ordering::Relaxed);
                }
                page
            }
            Err(_) => {
                cancel.cancel();
                self.engine.interrupt();
                Err(Error::Timeout)
            }
        }
    }

    pub async fn get_stats(&self) -> Result<Stats> {
        let mut stats = self.engine.statistics().await?;
        stats.thumbnail_bytes = self.files.thumbnail_bytes();
        stats.ingest_dropped = self.ingest.dropped_count();
        Ok(stats)
    }

    /// Full payload for the hover preview. Missing items are `None`, not an
    /// error - the row may have been cleaned up under the UI.
    pub async fn load_preview_data(&self, id: &str) -> Result<Option<Bytes>> {
        let item = match self.engine.load_item(id.to_string()).await {
            Ok(item) => item,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        if let Some(blob) = &item.storage_ref {
            return Ok(Some(Bytes::from(self.files.read_blob(blob)?)));
        }
        if let Some(raw) = item.raw_data {
            return Ok(Some(Bytes::from(raw)));
        }
        Ok(Some(Bytes::from(item.plain_text.into_bytes())))
    }

    pub fn events(&self) -> impl Stream<Item = Event> + Send + Unpin {
        self.bus.subscribe()
    }

    // -- writes -----------------------------------------------------------

    /// Feed one capture from the pasteboard driver into the pipeline.
    pub async fn ingest(&self, capture: RawCapture) -> Result<IngestOutcome> {
        self.guard_writes()?;
        self.latch_fatal(self.ingest.ingest(capture).await)
    }

    /// Ingest with an explicit capture timestamp (replays, tests).
    pub async fn ingest_at(&self, capture: RawCapture, captured_at: f64) -> Result<IngestOutcome> {
        self.guard_writes()?;
        self.latch_fatal(self.ingest.ingest_at(capture, captured_at).await)
    }

    pub async fn pin(&self, id: &str) -> Result<()> {
        self.set_pinned(id, true).await
    }

    pub async fn unpin(&self, id: &str) -> Result<()> {
        self.set_pinned(id, false).await
    }

    async fn set_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        self.guard_writes()?;
        let result = self.writer.update_metadata(id, Some(pinned), None).await;
        match self.latch_fatal(result) {
            Ok(_) => {
                let _ = self
                    .engine
                    .apply_delta(IndexDelta::PinChanged {
                        id: id.to_string(),
                        pinned,
                    })
                    .await;
                Ok(())
            }
            // Pinning something already gone is success, not failure.
            Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.guard_writes()?;
        let result = self.writer.delete(id).await;
        match self.latch_fatal(result) {
            Ok(storage_ref) => {
                if let Some(blob) = storage_ref {
                    self.files.delete_blob(&blob);
                }
                self.files.delete_thumbnail(id);
                let _ = self
                    .engine
                    .apply_delta(IndexDelta::Removed { id: id.to_string() })
                    .await;
                Ok(())
            }
            Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_all(&self, keep_pinned: bool) -> Result<()> {
        self.guard_writes()?;
        let result = self.writer.delete_all(keep_pinned).await;
        let execution = self.latch_fatal(result)?;

        for id in &execution.deleted_ids {
            self.files.delete_thumbnail(id);
        }
        reclaim_blobs(self.files.clone(), execution.reclaim).await;

        if keep_pinned {
            // Pinned rows survive; the index must rebuild, not just empty.
            let _ = self.engine.invalidate_caches().await;
        } else {
            let _ = self.engine.apply_delta(IndexDelta::Cleared).await;
        }
        Ok(())
    }

    /// Enforce the retention caps now.
    pub async fn run_cleanup(&self) -> Result<CleanupReport> {
        self.guard_writes()?;
        let settings = self.settings.read().unwrap().clone();
        let result = self.cleanup.run(&settings).await;
        self.latch_fatal(result)
    }

    /// Sweep `content/` for unreferenced blobs immediately.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        self.cleanup.orphan_sweep(true).await
    }

    // -- pasteboard / settings --------------------------------------------

    /// Put an item's text back on the system pasteboard. Non-text items
    /// surface their plain-text form; full externalized text is loaded from
    /// the content store.
    pub async fn copy_to_pasteboard(&self, id: &str) -> Result<()> {
        let item = self.engine.load_item(id.to_string()).await?;
        let text = match (&item.item_type, &item.storage_ref) {
            (ItemType::Text, Some(blob)) => {
                String::from_utf8_lossy(&self.files.read_blob(blob)?).into_owned()
            }
            _ => item.plain_text,
        };
        self.pasteboard.set_text(&text)
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Write-through settings update: persist first, then swap the live
    /// record and notify subscribers.
    pub async fn update_settings(&self, new_settings: Settings) -> Result<()> {
        self.settings_store.save(&new_settings)?;
        *self.settings.write().unwrap() = new_settings.clone();
        let _ = self.engine.update_settings(new_settings.clone()).await;
        self.bus.publish(Event::SettingsChanged(new_settings));
        Ok(())
    }

    // -- corruption latch -------------------------------------------------

    fn guard_writes(&self) -> Result<()> {
        if self.corrupt.load(Ordering::Relaxed) {
            return Err(Error::DbCorrupt("store is poisoned".into()));
        }
        Ok(())
    }

    fn latch_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.corrupt.swap(true, Ordering::Relaxed) {
                tracing::error!("store corruption detected: {e}");
                self.bus.publish(Event::CorruptDetected);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettingsStore;
    use crate::pasteboard::NullPasteboard;

    async fn service() -> (tempfile::TempDir, ClipboardService, Arc<NullPasteboard>) {
        let dir = tempfile::tempdir().unwrap();
        let pasteboard = Arc::new(NullPasteboard::default());
        let service = ClipboardService::start(ServiceOptions {
            paths: DataPaths::new(dir.path()),
            settings_store: Arc::new(MemorySettingsStore::default()),
            pasteboard: pasteboard.clone(),
        })
        .await
        .unwrap();
        (dir, service, pasteboard)
    }

    fn text(t: &str) -> RawCapture {
        RawCapture::Text {
            text: t.to_string(),
            app_bundle_id: None,
        }
    }

    #[tokio::test]
    async fn start_ingest_fetch_stop() {
        let (_dir, service, _pb) = service().await;

        service.ingest(text("alpha")).await.unwrap();
        service.ingest(text("beta")).await.unwrap();

        let (items, has_more) = service
            .fetch_recent(10, 0, RecentFilter::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(!has_more);
        assert_eq!(items[0].preview, "beta");

        service.stop().await;
    }

    #[tokio::test]
    async fn pin_and_delete_are_idempotent() {
        let (_dir, service, _pb) = service().await;
        service.ingest(text("pinnable")).await.unwrap();
        let (items, _) = service
            .fetch_recent(1, 0, RecentFilter::default())
            .await
            .unwrap();
        let id = items[0].id.clone();

        service.pin(&id).await.unwrap();
        service.pin(&id).await.unwrap(); // second pin is a no-op
        service.delete(&id).await.unwrap();
        service.delete(&id).await.unwrap(); // already gone: still success
        service.pin("never-existed").await.unwrap();

        service.stop().await;
    }

    #[tokio::test]
    async fn copy_to_pasteboard_writes_plain_text() {
        let (_dir, service, pasteboard) = service().await;
        service.ingest(text("copy me")).await.unwrap();
        let (items, _) = service
            .fetch_recent(1, 0, RecentFilter::default())
            .await
            .unwrap();

        service.copy_to_pasteboard(&items[0].id).await.unwrap();
        assert_eq!(pasteboard.last_text().as_deref(), Some("copy me"));

        service.stop().await;
    }

    #[tokio::test]
    async fn update_settings_publishes_event() {
        let (_dir, service, _pb) = service().await;
        let mut stream = service.events();

        let mut settings = service.get_settings();
        settings.max_items = 123;
        service.update_settings(settings.clone()).await.unwrap();
        assert_eq!(service.get_settings().max_items, 123);

        use tokio_stream::StreamExt;
        match stream.next().await.unwrap() {
            Event::SettingsChanged(s) => assert_eq!(s.max_items, 123),
            other => panic!("expected settings event, got {other:?}"),
        }

        service.stop().await;
    }

    #[tokio::test]
    async fn load_preview_returns_none_for_missing() {
        let (_dir, service, _pb) = service().await;
        assert!(service.load_preview_data("ghost").await.unwrap().is_none());
        service.stop().await;
    }
}
