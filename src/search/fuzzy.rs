//! In-memory fuzzy index
//!
//! Dense array of indexed items plus a character -> posting-list map.
//! Slots are append-only; deletions and text changes tombstone the old slot
//! (posting removal is expensive, a `None` entry is cheap). When tombstones
//! pass the reclamation threshold the index compacts itself.
//!
//! The index can serialize to a single file next to the database, with a
//! SHA-256 sidecar and a DB size+mtime fingerprint. Loading is best-effort:
//! any validation failure falls back to a rebuild - correctness trumps
//! latency.

use crate::error::{Error, Result};
use crate::store::IndexRow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Tombstone share (of total slots) that marks the index for compaction.
const TOMBSTONE_RECLAIM_RATIO: f64 = 0.2;

/// One live slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedItem {
    pub row_id: i64,
    pub id: String,
    pub text_lower: String,
    pub app_bundle_id: Option<String>,
    pub item_type: crate::store::ItemType,
    pub is_pinned: bool,
    pub last_used_at: f64,
}

pub struct FuzzyIndex {
    items: Vec<Option<IndexedItem>>,
    id_to_slot: HashMap<String, usize>,
    char_postings: HashMap<char, Vec<u32>>,
    /// `meta.mutation_seq` the index is current as of.
    generation: u64,
    tombstones: usize,
    stale: bool,
}

impl FuzzyIndex {
    pub fn new(generation: u64) -> Self {
        Self {
            items: Vec::new(),
            id_to_slot: HashMap::new(),
            char_postings: HashMap::new(),
            generation,
            tombstones: 0,
            stale: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn live_count(&self) -> usize {
        self.items.len() - self.tombstones
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// True when the next fuzzy query should compact or rebuild first.
    pub fn needs_compaction(&self) -> bool {
        if self.stale {
            return true;
        }
        !self.items.is_empty()
            && self.tombstones as f64 / self.items.len() as f64 > TOMBSTONE_RECLAIM_RATIO
    }

    /// Append a slot for a new or re-texted item. An existing slot for the
    /// same id is tombstoned; postings for the new text are appended, which
    /// keeps every posting list sorted for free.
    pub fn upsert(&mut self, row: IndexRow) {
        if let Some(old_slot) = self.id_to_slot.get(&row.id).copied() {
            if let Some(existing) = self.items[old_slot].as_mut() {
                if existing.row_id == row.row_id
                    && existing.text_lower == row.plain_text.to_lowercase()
                {
                    // Metadata-only change: update in place.
                    existing.is_pinned = row.is_pinned;
                    existing.last_used_at = row.last_used_at;
                    return;
                }
            }
            self.tombstone(old_slot);
        }

        let slot = self.items.len();
        let text_lower = row.plain_text.to_lowercase();
        for ch in unique_chars(&text_lower) {
            self.char_postings.entry(ch).or_default().push(slot as u32);
        }
        self.items.push(Some(IndexedItem {
            row_id: row.row_id,
            id: row.id.clone(),
            text_lower,
            app_bundle_id: row.app_bundle_id,
            item_type: row.item_type,
            is_pinned: row.is_pinned,
            last_used_at: row.last_used_at,
        }));
        self.id_to_slot.insert(row.id, slot);
    }

    pub fn remove(&mut self, id: &str) {
        if let Some(slot) = self.id_to_slot.remove(id) {
            self.tombstone_slot_only(slot);
        }
    }

    fn tombstone(&mut self, slot: usize) {
        if let Some(item) = self.items[slot].take() {
            self.id_to_slot.remove(&item.id);
            self.tombstones += 1;
        }
    }

    fn tombstone_slot_only(&mut self, slot: usize) {
        if self.items[slot].take().is_some() {
            self.tombstones += 1;
        }
    }

    /// Pin changes are in-place; no tombstone needed.
    pub fn set_pinned(&mut self, id: &str, pinned: bool) {
        if let Some(&slot) = self.id_to_slot.get(id) {
            if let Some(item) = self.items[slot].as_mut() {
                item.is_pinned = pinned;
            }
        }
    }

    pub fn touch(&mut self, id: &str, last_used_at: f64) {
        if let Some(&slot) = self.id_to_slot.get(id) {
            if let Some(item) = self.items[slot].as_mut() {
                item.last_used_at = last_used_at;
            }
        }
    }

    /// Drop everything (clearAll rebuilds from scratch).
    pub fn clear(&mut self) {
        self.items.clear();
        self.id_to_slot.clear();
        self.char_postings.clear();
        self.tombstones = 0;
        self.stale = false;
    }

    /// Rewrite the dense arrays without tombstones. Purely in-memory; the
    /// generation is unchanged because no rows were consulted.
    pub fn compact(&mut self) {
        let old = std::mem::take(&mut self.items);
        self.id_to_slot.clear();
        self.char_postings.clear();
        self.tombstones = 0;
        self.stale = false;

        for item in old.into_iter().flatten() {
            let slot = self.items.len();
            for ch in unique_chars(&item.text_lower) {
                self.char_postings.entry(ch).or_default().push(slot as u32);
            }
            self.id_to_slot.insert(item.id.clone(), slot);
            self.items.push(Some(item));
        }
    }

    pub fn get(&self, slot: u32) -> Option<&IndexedItem> {
        self.items.get(slot as usize).and_then(|s| s.as_ref())
    }

    /// Sorted slots containing every unique non-whitespace character of the
    /// query. An unknown character yields an empty candidate set.
    pub fn candidates(&self, query_lower: &str) -> Vec<u32> {
        let mut lists: Vec<&Vec<u32>> = Vec::new();
        for ch in unique_chars(query_lower) {
            match self.char_postings.get(&ch) {
                Some(list) => lists.push(list),
                None => return Vec::new(),
            }
        }
        if lists.is_empty() {
            // No usable characters: every live slot is a candidate.
            return self
                .items
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
                .collect();
        }

        // Intersect starting from the shortest list.
        lists.sort_by_key(|l| l.len());
        let mut current: Vec<u32> = lists[0].clone();
        for list in &lists[1..] {
            current = intersect_sorted(&current, list);
            if current.is_empty() {
                return current;
            }
        }
        // Tombstoned slots still sit in postings; filter them here.
        current.retain(|&slot| self.items[slot as usize].is_some());
        current
    }
}

fn unique_chars(text: &str) -> impl Iterator<Item = char> + '_ {
    let mut seen = std::collections::HashSet::new();
    text.chars()
        .filter(|c| !c.is_whitespace())
        .filter(move |c| seen.insert(*c))
}

fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// In-order subsequence match with bonuses for contiguity and an earlier
/// starting position. Returns `None` when the characters do not all appear
/// in order.
pub fn subsequence_score(text_lower: &str, query_chars: &[char]) -> Option<f64> {
    if query_chars.is_empty() {
        return Some(0.0);
    }
    let mut qi = 0;
    let mut score = 0.0f64;
    let mut last_match: Option<usize> = None;
    let mut first_match = 0usize;

    for (pos, ch) in text_lower.chars().enumerate() {
        if ch == query_chars[qi] {
            let contiguous = last_match.map_or(false, |lm| pos == lm + 1);
            score += if contiguous { 2.0 } else { 1.0 };
            if last_match.is_none() {
                first_match = pos;
            }
            last_match = Some(pos);
            qi += 1;
            if qi == query_chars.len() {
                return Some(score - first_match as f64 * 0.05);
            }
        }
    }
    None
}

/// Loose mode: the whole query (whitespace stripped) as one subsequence.
pub fn fuzzy_score(text_lower: &str, query_lower: &str) -> Option<f64> {
    let chars: Vec<char> = query_lower.chars().filter(|c| !c.is_whitespace()).collect();
    subsequence_score(text_lower, &chars)
}

/// Tightened mode: ASCII tokens of length >= 3 must appear as a contiguous
/// substring; CJK and short tokens fall back to subsequence matching.
pub fn fuzzy_plus_score(text_lower: &str, query_lower: &str) -> Option<f64> {
    let mut total = 0.0f64;
    for token in query_lower.split_whitespace() {
        let char_len = token.chars().count();
        if token.is_ascii() && char_len >= 3 {
            let pos = text_lower.find(token)?;
            // Contiguous hit: full contiguity bonus, early-position bonus.
            total += char_len as f64 * 2.0 - pos as f64 * 0.05;
        } else {
            let chars: Vec<char> = token.chars().collect();
            total += subsequence_score(text_lower, &chars)?;
        }
    }
    Some(total)
}

// ---------------------------------------------------------------------------
// Cold-start serialization
// ---------------------------------------------------------------------------

/// Size+mtime of the database file and its WAL, captured when the index is
/// saved and re-checked before a load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbFingerprint {
    db_len: u64,
    db_mtime: u64,
    wal_len: u64,
    wal_mtime: u64,
}

impl DbFingerprint {
    pub fn capture(db_path: &Path) -> Self {
        let stat = |p: &Path| -> (u64, u64) {
            match std::fs::metadata(p) {
                Ok(m) => {
                    let mtime = m
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    (m.len(), mtime)
                }
                Err(_) => (0, 0),
            }
        };
        let (db_len, db_mtime) = stat(db_path);
        let wal_path = db_path.with_extension("db-wal");
        let (wal_len, wal_mtime) = stat(&wal_path);
        Self {
            db_len,
            db_mtime,
            wal_len,
            wal_mtime,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    generation: u64,
    fingerprint: DbFingerprint,
    items: Vec<Option<IndexedItem>>,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

impl FuzzyIndex {
    /// Serialize to `index_path` with a SHA-256 sidecar. Written via a temp
    /// file + rename so a crash never leaves a torn snapshot under the
    /// final name.
    pub fn save(
        &self,
        index_path: &Path,
        sidecar_path: &Path,
        fingerprint: DbFingerprint,
    ) -> Result<()> {
        let snapshot = Snapshot {
            generation: self.generation,
            fingerprint,
            items: self.items.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::Internal(format!("index serialize: {e}")))?;

        let tmp = index_path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, index_path)?;
        std::fs::write(sidecar_path, sha256_hex(&bytes))?;
        Ok(())
    }

    /// Load a previously saved index. Returns `None` on any validation
    /// failure (missing files, sidecar mismatch, fingerprint or generation
    /// drift) - the caller rebuilds instead.
    pub fn load(
        index_path: &Path,
        sidecar_path: &Path,
        expected_fingerprint: &DbFingerprint,
        expected_generation: u64,
    ) -> Option<Self> {
        let bytes = std::fs::read(index_path).ok()?;
        let sidecar = std::fs::read_to_string(sidecar_path).ok()?;
        if sidecar.trim() != sha256_hex(&bytes) {
            tracing::warn!("fuzzy index sidecar mismatch; rebuilding");
            return None;
        }

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| tracing::warn!("fuzzy index parse failed: {e}"))
            .ok()?;
        if &snapshot.fingerprint != expected_fingerprint {
            tracing::info!("database changed since index snapshot; rebuilding");
            return None;
        }
        if snapshot.generation != expected_generation {
            tracing::info!("mutation_seq advanced past index snapshot; rebuilding");
            return None;
        }

        let mut index = FuzzyIndex::new(snapshot.generation);
        for item in snapshot.items.into_iter().flatten() {
            let slot = index.items.len();
            for ch in unique_chars(&item.text_lower) {
                index.char_postings.entry(ch).or_default().push(slot as u32);
            }
            index.id_to_slot.insert(item.id.clone(), slot);
            index.items.push(Some(item));
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(row_id: i64, id: &str, text: &str, pinned: bool, at: f64) -> IndexRow {
        IndexRow {
            row_id,
            id: id.to_string(),
            plain_text: text.to_string(),
            app_bundle_id: None,
            item_type: crate::store::ItemType::Text,
            is_pinned: pinned,
            last_used_at: at,
        }
    }

    fn index_of(rows: &[(i64, &str, &str)]) -> FuzzyIndex {
        let mut index = FuzzyIndex::new(1);
        for (row_id, id, text) in rows {
            index.upsert(row(*row_id, id, text, false, *row_id as f64));
        }
        index
    }

    #[test]
    fn candidates_require_every_query_char() {
        let index = index_of(&[(1, "a", "foobar baz"), (2, "b", "quux")]);
        assert_eq!(index.candidates("foo"), vec![0]);
        assert_eq!(index.candidates("fq"), Vec::<u32>::new());
        assert_eq!(index.candidates("zzz9"), Vec::<u32>::new());
    }

    #[test]
    fn subsequence_prefers_contiguous_and_early_matches() {
        let chars: Vec<char> = "abc".chars().collect();
        let contiguous = subsequence_score("abc at start", &chars).unwrap();
        let scattered = subsequence_score("a_b_c at start", &chars).unwrap();
        assert!(contiguous > scattered);

        let early = subsequence_score("abc later", &chars).unwrap();
        let late = subsequence_score("xxxxx abc", &chars).unwrap();
        assert!(early > late);
    }

    #[test]
    fn subsequence_rejects_out_of_order() {
        let chars: Vec<char> = "ba".chars().collect();
        assert!(subsequence_score("ab", &chars).is_none());
    }

    #[test]
    fn fuzzy_plus_requires_contiguous_ascii_tokens() {
        // The "AAA matches a..a..a" false positive fuzzy users complain about.
        assert!(fuzzy_score("f_o_o_b_a_r baz", "foobar").is_some());
        assert!(fuzzy_plus_score("f_o_o_b_a_r baz", "foobar").is_none());
        assert!(fuzzy_plus_score("foobar baz", "foobar").is_some());
    }

    #[test]
    fn fuzzy_plus_short_and_cjk_tokens_use_subsequence() {
        // Two-char ASCII token: subsequence is allowed.
        assert!(fuzzy_plus_score("c_m", "cm").is_some());
        // CJK token of length >= 3: subsequence, not substring.
        assert!(fuzzy_plus_score("日x本x語", "日本語").is_some());
        assert!(fuzzy_plus_score("日x本", "日本語").is_none());
    }

    #[test]
    fn upsert_same_metadata_updates_in_place() {
        let mut index = index_of(&[(1, "a", "hello")]);
        index.upsert(row(1, "a", "hello", true, 9.0));
        assert_eq!(index.live_count(), 1);
        let item = index.get(0).unwrap();
        assert!(item.is_pinned);
        assert_eq!(item.last_used_at, 9.0);
    }

    #[test]
    fn text_change_tombstones_old_slot() {
        let mut index = index_of(&[(1, "a", "old text")]);
        index.upsert(row(1, "a", "new words", false, 2.0));
        assert_eq!(index.live_count(), 1);
        // Old slot is gone; candidate search hits the new slot only.
        assert_eq!(index.candidates("words"), vec![1]);
    }

    #[test]
    fn remove_tombstones_until_compaction() {
        let mut index = index_of(&[(1, "a", "one"), (2, "b", "two"), (3, "c", "three")]);
        index.remove("a");
        assert_eq!(index.live_count(), 2);
        assert!(index.needs_compaction()); // 1/3 > 0.2

        index.compact();
        assert_eq!(index.live_count(), 2);
        assert!(!index.needs_compaction());
        // Slots renumbered densely; both survivors findable.
        assert_eq!(index.candidates("two").len(), 1);
        assert_eq!(index.candidates("three").len(), 1);
    }

    #[test]
    fn removing_last_item_leaves_empty_index() {
        let mut index = index_of(&[(1, "a", "solo")]);
        index.remove("a");
        index.compact();
        assert_eq!(index.live_count(), 0);
        assert!(index.candidates("solo").is_empty());
        assert!(index.candidates("").is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("clipboard.db");
        std::fs::write(&db_path, b"pretend database").unwrap();
        let index_path = dir.path().join("fuzzy_index.bin");
        let sidecar = dir.path().join("fuzzy_index.sha256");

        let mut index = index_of(&[(1, "a", "persisted text")]);
        index.set_generation(42);
        let fp = DbFingerprint::capture(&db_path);
        index.save(&index_path, &sidecar, fp.clone()).unwrap();

        let loaded = FuzzyIndex::load(&index_path, &sidecar, &fp, 42).unwrap();
        assert_eq!(loaded.generation(), 42);
        assert_eq!(loaded.live_count(), 1);
        assert_eq!(loaded.candidates("persisted").len(), 1);
    }

    #[test]
    fn load_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("clipboard.db");
        std::fs::write(&db_path, b"db").unwrap();
        let index_path = dir.path().join("fuzzy_index.bin");
        let sidecar = dir.path().join("fuzzy_index.sha256");

        let index = index_of(&[(1, "a", "text")]);
        let fp = DbFingerprint::capture(&db_path);
        index.save(&index_path, &sidecar, fp.clone()).unwrap();

        // Flip a byte in the snapshot.
        let mut bytes = std::fs::read(&index_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&index_path, bytes).unwrap();

        assert!(FuzzyIndex::load(&index_path, &sidecar, &fp, 1).is_none());
    }

    #[test]
    fn load_rejects_generation_drift() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("clipboard.db");
        std::fs::write(&db_path, b"db").unwrap();
        let index_path = dir.path().join("fuzzy_index.bin");
        let sidecar = dir.path().join("fuzzy_index.sha256");

        let mut index = index_of(&[(1, "a", "text")]);
        index.set_generation(5);
        let fp = DbFingerprint::capture(&db_path);
        index.save(&index_path, &sidecar, fp.clone()).unwrap();

        assert!(FuzzyIndex::load(&index_path, &sidecar, &fp, 6).is_none());
    }
}
