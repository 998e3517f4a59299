//! External blob storage
//!
//! Large payloads live outside the database as one file per item under
//! `content/`. Writes are atomic: the bytes land in `content/<uuid>.tmp`,
//! get fsynced, then rename into place - a crash can leave a stray `.tmp`
//! (reclaimed by the orphan sweep) but never a half-written blob under its
//! final name.
//!
//! Every read goes through a safe-path validator that rejects traversal,
//! symlinks and anything outside the store root. Deletes are best-effort:
//! failures are logged and left to the orphan sweep.

use crate::config::DataPaths;
use crate::error::{Error, Result};
use crate::store::ItemType;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct FileStore {
    root: PathBuf,
    content_dir: PathBuf,
    thumbnails_dir: PathBuf,
    spool_dir: PathBuf,
}

impl FileStore {
    /// Create the directory layout under the data root.
    pub fn open(paths: &DataPaths) -> Result<Self> {
        let store = Self {
            root: paths.root().to_path_buf(),
            content_dir: paths.content_dir(),
            thumbnails_dir: paths.thumbnails_dir(),
            spool_dir: paths.spool_dir(),
        };
        std::fs::create_dir_all(&store.content_dir)?;
        std::fs::create_dir_all(&store.thumbnails_dir)?;
        std::fs::create_dir_all(&store.spool_dir)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// File extension used for a blob of the given type.
    pub fn extension_for(item_type: ItemType) -> &'static str {
        match item_type {
            ItemType::Text => "txt",
            ItemType::Rtf => "rtf",
            ItemType::Html => "html",
            ItemType::Image => "png",
            ItemType::File => "txt",
            ItemType::Other => "bin",
        }
    }

    /// Atomically write a blob into `content/` and return its final path.
    pub fn write_blob(&self, data: &[u8], item_type: ItemType) -> Result<PathBuf> {
        let name = Uuid::new_v4().to_string();
        let tmp = self.content_dir.join(format!("{name}.tmp"));
        let final_path = self
            .content_dir
            .join(format!("{name}.{}", Self::extension_for(item_type)));

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = std::fs::rename(&tmp, &final_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(final_path)
    }

    /// Write an in-flight payload into the ingest spool.
    pub fn spool_write(&self, data: &[u8]) -> Result<PathBuf> {
        let path = self.spool_dir.join(Uuid::new_v4().to_string());
        let mut file = std::fs::File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Move a spool file into `content/`. Rename first (same filesystem),
    /// copy-then-delete as the fallback.
    pub fn promote_spool(&self, spool_path: &Path, item_type: ItemType) -> Result<PathBuf> {
        let name = Uuid::new_v4().to_string();
        let final_path = self
            .content_dir
            .join(format!("{name}.{}", Self::extension_for(item_type)));

        match std::fs::rename(spool_path, &final_path) {
            Ok(()) => Ok(final_path),
            Err(_) => {
                std::fs::copy(spool_path, &final_path)?;
                let _ = std::fs::remove_file(spool_path);
                Ok(final_path)
            }
        }
    }

    /// Validate that `path` is a plain file inside `content/`. Rejects
    /// traversal components, symlinks and out-of-root paths.
    pub fn validate_content_path(&self, path: &Path) -> Result<PathBuf> {
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::IoFailed(format!(
                "path traversal rejected: {}",
                path.display()
            )));
        }

        let meta = std::fs::symlink_metadata(path)
            .map_err(|_| Error::IoFailed(format!("blob missing: {}", path.display())))?;
        if meta.file_type().is_symlink() {
            return Err(Error::IoFailed(format!(
                "symlink rejected: {}",
                path.display()
            )));
        }

        let canonical = std::fs::canonicalize(path)?;
        let canonical_root = std::fs::canonicalize(&self.content_dir)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::IoFailed(format!(
                "path outside content store: {}",
                path.display()
            )));
        }
        Ok(canonical)
    }

    /// Read a blob after validating its path.
    pub fn read_blob(&self, path: &Path) -> Result<Vec<u8>> {
        let safe = self.validate_content_path(path)?;
        Ok(std::fs::read(safe)?)
    }

    /// Best-effort blob deletion; failures are logged, never fatal.
    pub fn delete_blob(&self, path: &Path) {
        match self.validate_content_path(path) {
            Ok(safe) => {
                if let Err(e) = std::fs::remove_file(&safe) {
                    tracing::warn!("blob delete failed for {}: {e}", safe.display());
                }
            }
            Err(e) => tracing::warn!("blob delete skipped: {e}"),
        }
    }

    /// Delete any thumbnail the UI rendered for this item.
    pub fn delete_thumbnail(&self, item_id: &str) {
        let path = self.thumbnails_dir.join(format!("{item_id}.png"));
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("thumbnail delete failed for {}: {e}", path.display());
            }
        }
    }

    /// Delete a spool file that ended up unused (dedup hit, error path).
    pub fn discard_spool(&self, path: &Path) {
        if path.starts_with(&self.spool_dir) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("spool discard failed for {}: {e}", path.display());
            }
        }
    }

    /// Every entry currently in `content/` (for the orphan sweep).
    pub fn list_content(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        Ok(entries)
    }

    /// Remove spool leftovers from a previous run.
    pub fn clear_spool(&self) {
        let Ok(entries) = std::fs::read_dir(&self.spool_dir) else {
            return;
        };
        for entry in entries.flatten() {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::debug!("spool clear failed for {}: {e}", entry.path().display());
            }
        }
    }

    /// Total bytes under `thumbnails/` (best-effort stat walk).
    pub fn thumbnail_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.thumbnails_dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}
