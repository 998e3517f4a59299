//! Ingest pipeline
//!
//! Turns raw pasteboard captures into persisted items:
//!
//! ```text
//! RawCapture → classify/extract → normalize → [spool if large]
//!     → hash (background for large payloads)
//!     → dedup probe (writer bump on hit, payload discarded)
//!     → externalize or inline → insert → index delta
//! ```
//!
//! Captures queue into a bounded pending list drained by a small worker
//! pool. When the queue is full the *oldest pending* capture is dropped
//! (logged and counted) - work already running is never killed mid-write.

mod normalize;

pub use normalize::normalize_text;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use crate::hash;
use crate::search::{IndexDelta, SearchEngine};
use crate::store::{IndexRow, ItemSummary, ItemType, NewItem, StoreWriter, WriteOutcome};
use crate::util::{now_epoch, tail_utf8_safe, truncate_utf8_safe};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Worker tasks hashing and persisting captures.
const WORKER_COUNT: usize = 4;
/// Pending captures held before the oldest is dropped (newest-8).
const PENDING_BOUND: usize = 8;

/// Normalized text larger than this keeps only a head+tail summary in
/// `plain_text`; the full text moves to the content store. Search over such
/// items is summary-scoped (surfaced in the settings file).
pub const TEXT_INDEX_BUDGET: usize = 1024 * 1024;
const SUMMARY_HEAD: usize = 768 * 1024;
const SUMMARY_TAIL: usize = 256 * 1024;

/// A capture as delivered by the external pasteboard polling driver.
#[derive(Debug, Clone)]
pub enum RawCapture {
    Text {
        text: String,
        app_bundle_id: Option<String>,
    },
    Rtf {
        data: Vec<u8>,
        plain_text: String,
        app_bundle_id: Option<String>,
    },
    Html {
        data: Vec<u8>,
        plain_text: String,
        app_bundle_id: Option<String>,
    },
    Image {
        data: Vec<u8>,
        caption: Option<String>,
        app_bundle_id: Option<String>,
    },
    FileList {
        paths: Vec<PathBuf>,
        app_bundle_id: Option<String>,
    },
    Other {
        data: Vec<u8>,
        caption: Option<String>,
        app_bundle_id: Option<String>,
    },
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// A new item was persisted.
    Stored(ItemSummary),
    /// Same content already existed; its timestamp and use count advanced.
    Deduplicated(ItemSummary),
    /// Capture type is disabled in settings.
    Ignored,
    /// Back-pressure dropped this capture while it was still pending.
    /// Not an error: the capture simply did not happen.
    Dropped,
}

struct Pending {
    capture: RawCapture,
    captured_at: f64,
    reply: oneshot::Sender<Result<IngestOutcome>>,
}

struct Shared {
    queue: Mutex<VecDeque<Pending>>,
    notify: Notify,
    dropped: AtomicU64,
    writer: Arc<StoreWriter>,
    engine: Arc<SearchEngine>,
    files: Arc<FileStore>,
    settings: Arc<RwLock<Settings>>,
    stop: CancellationToken,
}

pub struct IngestPipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IngestPipeline {
    pub fn spawn(
        writer: Arc<StoreWriter>,
        engine: Arc<SearchEngine>,
        files: Arc<FileStore>,
        settings: Arc<RwLock<Settings>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            writer,
            engine,
            files,
            settings,
            stop: CancellationToken::new(),
        });

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for n in 0..WORKER_COUNT {
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(shared).await;
                tracing::trace!(worker = n, "ingest worker stopped");
            }));
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a capture stamped with the current wall clock.
    pub async fn ingest(&self, capture: RawCapture) -> Result<IngestOutcome> {
        self.ingest_at(capture, now_epoch()).await
    }

    /// Enqueue a capture with an explicit timestamp (tests, replays).
    pub async fn ingest_at(&self, capture: RawCapture, captured_at: f64) -> Result<IngestOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= PENDING_BOUND {
                // Overflow: drop the oldest still-pending capture.
                if let Some(victim) = queue.pop_front() {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        total_dropped = self.shared.dropped.load(Ordering::Relaxed),
                        "ingest back-pressure: dropped oldest pending capture"
                    );
                    let _ = victim.reply.send(Ok(IngestOutcome::Dropped));
                }
            }
            queue.push_back(Pending {
                capture,
                captured_at,
                reply: reply_tx,
            });
        }
        self.shared.notify.notify_one();

        reply_rx
            .await
            .map_err(|_| Error::Internal("ingest worker dropped reply".into()))?
    }

    /// Captures dropped by back-pressure since startup.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        self.shared.stop.cancel();
        self.shared.notify.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
        // Anything still queued did not happen.
        let mut queue = self.shared.queue.lock().unwrap();
        while let Some(pending) = queue.pop_front() {
            let _ = pending.reply.send(Ok(IngestOutcome::Dropped));
        }
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let pending = shared.queue.lock().unwrap().pop_front();
        match pending {
            Some(pending) => {
                let result =
                    process_capture(&shared, pending.capture, pending.captured_at).await;
                let _ = pending.reply.send(result);
            }
            None => {
                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    _ = shared.notify.notified() => {}
                }
            }
        }
    }
}

/// Extracted payload: what gets hashed and (maybe) persisted out-of-row.
/// File lists have no payload and take their own early path.
enum Payload {
    /// Binary bytes (rtf, html, image, other).
    Bytes(Vec<u8>),
    /// Text items: the normalized text *is* the content.
    TextOnly,
}

async fn process_capture(
    shared: &Shared,
    capture: RawCapture,
    captured_at: f64,
) -> Result<IngestOutcome> {
    let settings = shared.settings.read().unwrap().clone();

    // 1. Classify and extract.
    let (item_type, app_bundle_id, raw_text, payload) = match capture {
        RawCapture::Text {
            text,
            app_bundle_id,
        } => (ItemType::Text, app_bundle_id, text, Payload::TextOnly),
        RawCapture::Rtf {
            data,
            plain_text,
            app_bundle_id,
        } => (ItemType::Rtf, app_bundle_id, plain_text, Payload::Bytes(data)),
        RawCapture::Html {
            data,
            plain_text,
            app_bundle_id,
        } => (ItemType::Html, app_bundle_id, plain_text, Payload::Bytes(data)),
        RawCapture::Image {
            data,
            caption,
            app_bundle_id,
        } => {
            if !settings.save_images {
                return Ok(IngestOutcome::Ignored);
            }
            let caption = caption.unwrap_or_else(|| "Image".to_string());
            (ItemType::Image, app_bundle_id, caption, Payload::Bytes(data))
        }
        RawCapture::FileList {
            paths,
            app_bundle_id,
        } => {
            if !settings.save_files {
                return Ok(IngestOutcome::Ignored);
            }
            if paths.is_empty() {
                return Err(Error::IoFailed("empty file list capture".into()));
            }
            let joined = paths
                .iter()
                .map(|p| p.to_string_lossy())
                .collect::<Vec<_>>()
                .join("\n");
            // The path list is both the display text and the hashed content.
            let hash = hash::hash_paths(&paths);
            return persist(
                shared,
                NewItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    item_type: ItemType::File,
                    content_hash: hash,
                    plain_text: normalize_text(&joined),
                    app_bundle_id,
                    captured_at,
                    size_bytes: joined.len() as i64,
                    storage_ref: None,
                    raw_data: None,
                },
                None,
            )
            .await;
        }
        RawCapture::Other {
            data,
            caption,
            app_bundle_id,
        } => {
            let caption = caption.unwrap_or_else(|| "Clipboard data".to_string());
            (ItemType::Other, app_bundle_id, caption, Payload::Bytes(data))
        }
    };

    // 2. Normalize the indexable text.
    let normalized = normalize_text(&raw_text);

    match payload {
        Payload::TextOnly => {
            if normalized.is_empty() {
                return Err(Error::IoFailed("empty text capture".into()));
            }
            process_text(shared, normalized, app_bundle_id, captured_at).await
        }
        Payload::Bytes(data) => {
            if data.is_empty() {
                return Err(Error::IoFailed("zero-byte payload".into()));
            }
            process_binary(
                shared,
                &settings,
                item_type,
                data,
                normalized,
                app_bundle_id,
                captured_at,
            )
            .await
        }
    }
}

/// Text path: the normalized text is the content. Oversized text keeps a
/// head+tail summary in the row and the full text in the content store.
async fn process_text(
    shared: &Shared,
    normalized: String,
    app_bundle_id: Option<String>,
    captured_at: f64,
) -> Result<IngestOutcome> {
    let content_hash = hash::hash_bytes_background(normalized.clone().into_bytes()).await?;
    let size_bytes = normalized.len() as i64;

    // 3. Dedup probe before any blob lands on disk.
    if let Some(summary) = shared.writer.touch_by_hash(&content_hash, captured_at).await? {
        notify_touch(shared, &summary).await;
        return Ok(IngestOutcome::Deduplicated(summary));
    }

    let (plain_text, storage_ref) = if normalized.len() > TEXT_INDEX_BUDGET {
        let summary_text = indexable_summary(&normalized);
        let blob = shared
            .files
            .write_blob(normalized.as_bytes(), ItemType::Text)?;
        (summary_text, Some(blob))
    } else {
        (normalized, None)
    };

    persist(
        shared,
        NewItem {
            id: uuid::Uuid::new_v4().to_string(),
            item_type: ItemType::Text,
            content_hash,
            plain_text,
            app_bundle_id,
            captured_at,
            size_bytes,
            storage_ref,
            raw_data: None,
        },
        None,
    )
    .await
}

/// Binary path: spool large payloads first, hash on the spool file, then
/// either inline the bytes or promote the spool into the content store.
async fn process_binary(
    shared: &Shared,
    settings: &Settings,
    item_type: ItemType,
    data: Vec<u8>,
    plain_text: String,
    app_bundle_id: Option<String>,
    captured_at: f64,
) -> Result<IngestOutcome> {
    let size_bytes = data.len() as i64;

    // 4. Spool large payloads so downstream steps carry a file reference,
    // not the bytes.
    let spooled: Option<PathBuf> = if data.len() >= settings.ingest_spool_threshold_bytes as usize
    {
        Some(shared.files.spool_write(&data)?)
    } else {
        None
    };

    // 5. Hash on the background; large payloads hash from the spool file.
    let content_hash = match &spooled {
        Some(path) => {
            // A running hash is allowed to finish; only shutdown stops it.
            hash::hash_file_background(path.clone(), shared.stop.child_token()).await?
        }
        None => hash::hash_bytes_background(data.clone()).await?,
    };

    // 6. Dedup probe. On a hit the new payload is discarded.
    if let Some(summary) = shared.writer.touch_by_hash(&content_hash, captured_at).await? {
        if let Some(path) = &spooled {
            shared.files.discard_spool(path);
        }
        notify_touch(shared, &summary).await;
        return Ok(IngestOutcome::Deduplicated(summary));
    }

    // 7. Externalize or inline.
    let externalize = data.len() >= settings.external_storage_threshold_bytes as usize;
    let (storage_ref, raw_data) = if externalize {
        let blob = match &spooled {
            Some(path) => shared.files.promote_spool(path, item_type)?,
            None => shared.files.write_blob(&data, item_type)?,
        };
        (Some(blob), None)
    } else {
        if let Some(path) = &spooled {
            shared.files.discard_spool(path);
        }
        (None, Some(data))
    };

    persist(
        shared,
        NewItem {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            content_hash,
            plain_text,
            app_bundle_id,
            captured_at,
            size_bytes,
            storage_ref: storage_ref.clone(),
            raw_data,
        },
        storage_ref,
    )
    .await
}

/// Insert through the writer. `written_blob` is compensated (deleted) when
/// the insert fails or loses a dedup race.
async fn persist(
    shared: &Shared,
    item: NewItem,
    written_blob: Option<PathBuf>,
) -> Result<IngestOutcome> {
    let plain_text = item.plain_text.clone();
    let outcome = match shared.writer.insert_or_update(item).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(blob) = &written_blob {
                shared.files.delete_blob(blob);
            }
            return Err(e);
        }
    };

    match outcome {
        WriteOutcome::Inserted(summary) => {
            let delta = IndexDelta::Upserted(IndexRow {
                row_id: summary.row_id,
                id: summary.id.clone(),
                plain_text,
                app_bundle_id: summary.app_bundle_id.clone(),
                item_type: summary.item_type,
                is_pinned: summary.is_pinned,
                last_used_at: summary.last_used_at,
            });
            let _ = shared.engine.apply_delta(delta).await;
            Ok(IngestOutcome::Stored(summary))
        }
        WriteOutcome::Updated(summary) => {
            // Lost a dedup race after writing our blob; the stored row owns
            // its own payload.
            if let Some(blob) = &written_blob {
                shared.files.delete_blob(blob);
            }
            notify_touch(shared, &summary).await;
            Ok(IngestOutcome::Deduplicated(summary))
        }
    }
}

async fn notify_touch(shared: &Shared, summary: &ItemSummary) {
    let _ = shared
        .engine
        .apply_delta(IndexDelta::Touched {
            id: summary.id.clone(),
            last_used_at: summary.last_used_at,
        })
        .await;
}

/// Head+tail summary for oversized text, cut on char boundaries.
fn indexable_summary(text: &str) -> String {
    let head = truncate_utf8_safe(text, SUMMARY_HEAD);
    let tail = tail_utf8_safe(text, SUMMARY_TAIL);
    format!("{head}\n…\n{tail}")
}
