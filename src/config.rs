//! Settings and on-disk layout
//!
//! Settings are loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Settings file (~/.config/clipkeep/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! The core treats the settings store as an external collaborator: it only
//! consumes a [`Settings`] record and writes one back through the
//! [`SettingsStore`] trait. The bundled implementation persists TOML.

use crate::error::{Error, Result};
use crate::search::SearchMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retention and behavior knobs consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Item-count cap enforced by cleanup.
    pub max_items: u64,

    /// Cap on the sum of inline payload bytes.
    pub max_inline_size_bytes: u64,

    /// Cap on the sum of externalized blob bytes.
    pub max_external_size_bytes: u64,

    /// Capture images at all.
    pub save_images: bool,

    /// Capture file lists at all.
    pub save_files: bool,

    /// Mode the UI starts in.
    pub default_search_mode: SearchMode,

    /// Queries at or below this length are served from the short-query cache
    /// (a prefilter over the most recent items, reported with `total = -1`).
    pub short_query_limit: usize,

    /// Size of the most-recent-items mirror behind short queries and regex.
    pub short_query_cache_size: usize,

    /// Payloads at or above this size are stored as external blobs.
    pub external_storage_threshold_bytes: u64,

    /// Payloads at or above this size are spooled to disk during ingest.
    pub ingest_spool_threshold_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_inline_size_bytes: 64 * 1024 * 1024,
            max_external_size_bytes: 1024 * 1024 * 1024,
            save_images: true,
            save_files: true,
            default_search_mode: SearchMode::FuzzyPlus,
            short_query_limit: 2,
            short_query_cache_size: 2000,
            external_storage_threshold_bytes: 100 * 1024,
            ingest_spool_threshold_bytes: 100 * 1024,
        }
    }
}

impl Settings {
    /// Load settings with env > file > defaults precedence.
    pub fn from_env() -> Self {
        let mut settings = Self::load_file().unwrap_or_default();
        settings.apply_env_overrides();
        settings
    }

    /// Environment variables win over any file-sourced value. Every load
    /// path runs this step, so precedence holds whether settings arrive
    /// through [`Settings::from_env`] or a [`SettingsStore`].
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CLIPKEEP_MAX_ITEMS") {
            if let Ok(n) = v.parse() {
                self.max_items = n;
            }
        }
        if let Ok(v) = std::env::var("CLIPKEEP_SEARCH_MODE") {
            if let Some(mode) = SearchMode::parse(&v) {
                self.default_search_mode = mode;
            }
        }
    }

    fn load_file() -> Option<Self> {
        let path = Self::config_path()?;
        let text = std::fs::read_to_string(path).ok()?;
        let file: FileSettings = toml::from_str(&text)
            .map_err(|e| tracing::warn!("Ignoring malformed settings file: {e}"))
            .ok()?;
        Some(file.merged_over(Settings::default()))
    }

    /// Path of the settings file (~/.config/clipkeep/config.toml).
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CLIPKEEP_CONFIG") {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join("clipkeep").join("config.toml"))
    }

    /// Render the settings as a commented TOML document.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# clipkeep settings
# Retention caps (cleanup deletes oldest unpinned items past these)
max_items = {}
max_inline_size_bytes = {}
max_external_size_bytes = {}

# Capture toggles
save_images = {}
save_files = {}

# Search behavior
# Modes: "exact", "fuzzy", "fuzzy_plus", "regex"
default_search_mode = "{}"
# Queries at or below this length search only the most recent
# short_query_cache_size items (a prefilter, reported as total = -1).
short_query_limit = {}
short_query_cache_size = {}

# Tiered storage thresholds.
# Text larger than ~1 MiB keeps only a head+tail summary in the search
# index; the full text lives in the content store.
external_storage_threshold_bytes = {}
ingest_spool_threshold_bytes = {}
"#,
            self.max_items,
            self.max_inline_size_bytes,
            self.max_external_size_bytes,
            self.save_images,
            self.save_files,
            self.default_search_mode.as_str(),
            self.short_query_limit,
            self.short_query_cache_size,
            self.external_storage_threshold_bytes,
            self.ingest_spool_threshold_bytes,
        )
    }
}

/// Settings file structure - every field optional so partial files merge
/// over the defaults instead of failing.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    max_items: Option<u64>,
    max_inline_size_bytes: Option<u64>,
    max_external_size_bytes: Option<u64>,
    save_images: Option<bool>,
    save_files: Option<bool>,
    default_search_mode: Option<String>,
    short_query_limit: Option<usize>,
    short_query_cache_size: Option<usize>,
    external_storage_threshold_bytes: Option<u64>,
    ingest_spool_threshold_bytes: Option<u64>,
}

impl FileSettings {
    fn merged_over(self, mut base: Settings) -> Settings {
        if let Some(v) = self.max_items {
            base.max_items = v;
        }
        if let Some(v) = self.max_inline_size_bytes {
            base.max_inline_size_bytes = v;
        }
        if let Some(v) = self.max_external_size_bytes {
            base.max_external_size_bytes = v;
        }
        if let Some(v) = self.save_images {
            base.save_images = v;
        }
        if let Some(v) = self.save_files {
            base.save_files = v;
        }
        if let Some(v) = self.default_search_mode.as_deref().and_then(SearchMode::parse) {
            base.default_search_mode = v;
        }
        if let Some(v) = self.short_query_limit {
            base.short_query_limit = v;
        }
        if let Some(v) = self.short_query_cache_size {
            base.short_query_cache_size = v;
        }
        if let Some(v) = self.external_storage_threshold_bytes {
            base.external_storage_threshold_bytes = v;
        }
        if let Some(v) = self.ingest_spool_threshold_bytes {
            base.ingest_spool_threshold_bytes = v;
        }
        base
    }
}

/// External collaborator contract: where settings live between runs.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// TOML-file settings store (the bundled implementation). Loads apply the
/// same environment overrides as [`Settings::from_env`], so the service
/// honors `CLIPKEEP_*` variables too, not just `config --show`.
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_location() -> Result<Self> {
        let path = Settings::config_path()
            .ok_or_else(|| Error::IoFailed("no config directory on this platform".into()))?;
        Ok(Self::new(path))
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings> {
        let mut settings = if self.path.exists() {
            let text = std::fs::read_to_string(&self.path)?;
            let file: FileSettings = toml::from_str(&text)
                .map_err(|e| Error::IoFailed(format!("settings parse: {e}")))?;
            file.merged_over(Settings::default())
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, settings.to_toml())?;
        Ok(())
    }
}

/// In-memory settings store for tests and the mock service wiring.
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: std::sync::Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: std::sync::Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        Ok(self.inner.lock().unwrap().clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.inner.lock().unwrap() = settings.clone();
        Ok(())
    }
}

/// On-disk layout under the application data root:
///
/// ```text
/// <root>/
///   clipboard.db        - relational store (+ -wal / -shm sidecars)
///   content/            - external payload blobs
///   thumbnails/         - UI-owned thumbnail cache (deleted on item removal)
///   fuzzy_index.bin     - serialized in-memory fuzzy index
///   fuzzy_index.sha256  - integrity sidecar
///   ingest_spool/       - transient large payloads in flight
///   logs/               - rotated tracing output
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform default: `<data_dir>/clipkeep`, overridable with
    /// `CLIPKEEP_DATA_DIR`.
    pub fn from_env() -> Result<Self> {
        if let Ok(dir) = std::env::var("CLIPKEEP_DATA_DIR") {
            return Ok(Self::new(dir));
        }
        dirs::data_dir()
            .map(|d| Self::new(d.join("clipkeep")))
            .ok_or_else(|| Error::IoFailed("no data directory on this platform".into()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("clipboard.db")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("ingest_spool")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("fuzzy_index.bin")
    }

    pub fn index_sidecar_path(&self) -> PathBuf {
        self.root.join("fuzzy_index.sha256")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.max_items, 10_000);
        assert_eq!(s.short_query_limit, 2);
        assert_eq!(s.short_query_cache_size, 2000);
        assert_eq!(s.external_storage_threshold_bytes, 102_400);
        assert_eq!(s.ingest_spool_threshold_bytes, 102_400);
        assert_eq!(s.default_search_mode, SearchMode::FuzzyPlus);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut s = Settings::default();
        s.max_items = 123;
        s.default_search_mode = SearchMode::Regex;
        let file: FileSettings = toml::from_str(&s.to_toml()).unwrap();
        let back = file.merged_over(Settings::default());
        assert_eq!(back, s);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let file: FileSettings = toml::from_str("max_items = 42").unwrap();
        let s = file.merged_over(Settings::default());
        assert_eq!(s.max_items, 42);
        assert_eq!(s.short_query_cache_size, 2000);
    }

    #[test]
    fn toml_store_applies_env_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_items = 5").unwrap();
        let store = TomlSettingsStore::new(path);

        assert_eq!(store.load().unwrap().max_items, 5);

        // The service loads through the store; the env var must still win.
        std::env::set_var("CLIPKEEP_MAX_ITEMS", "77");
        let loaded = store.load();
        std::env::remove_var("CLIPKEEP_MAX_ITEMS");
        assert_eq!(loaded.unwrap().max_items, 77);
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemorySettingsStore::default();
        let mut s = store.load().unwrap();
        s.max_items = 7;
        store.save(&s).unwrap();
        assert_eq!(store.load().unwrap().max_items, 7);
    }

    #[test]
    fn data_paths_layout() {
        let p = DataPaths::new("/tmp/ck");
        assert!(p.db_path().ends_with("clipboard.db"));
        assert!(p.content_dir().ends_with("content"));
        assert!(p.spool_dir().ends_with("ingest_spool"));
        assert!(p.index_path().ends_with("fuzzy_index.bin"));
        assert!(p.index_sidecar_path().ends_with("fuzzy_index.sha256"));
    }
}
