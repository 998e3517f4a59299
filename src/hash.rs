//! Content fingerprinting for dedup
//!
//! Every capture gets a SHA-256 digest over its canonical byte
//! representation: normalized UTF-8 for text, raw payload bytes for binary
//! types, the joined absolute path list for file references. Two captures
//! with equal digests collapse to one stored item.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Payloads at or above this size hash on a blocking task instead of the
/// async worker, and file hashing streams in chunks of this size.
pub const BACKGROUND_HASH_THRESHOLD: usize = 100 * 1024;

const CHUNK_SIZE: usize = 64 * 1024;

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Digest of an in-memory payload.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Digest of normalized text (UTF-8 bytes). Callers normalize first; the
/// hasher itself is byte-oriented.
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Digest of a file-reference capture: the UTF-8 bytes of the absolute
/// paths joined with `\n`. Order is significant.
pub fn hash_paths(paths: &[std::path::PathBuf]) -> String {
    let joined = paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    hash_bytes(joined.as_bytes())
}

/// Streaming digest of a spooled file.
///
/// Reads in fixed-size chunks with a cancellation check between chunks, so a
/// multi-hundred-megabyte payload never pins the hasher past a cancel. No
/// buffer is reallocated per chunk.
pub fn hash_file(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

/// Hash a payload that may be large, off the async worker when it is.
pub async fn hash_bytes_background(data: Vec<u8>) -> Result<String> {
    if data.len() < BACKGROUND_HASH_THRESHOLD {
        return Ok(hash_bytes(&data));
    }
    tokio::task::spawn_blocking(move || hash_bytes(&data))
        .await
        .map_err(|e| Error::Internal(format!("hash task join: {e}")))
}

/// Hash a spool file on a blocking task.
pub async fn hash_file_background(
    path: std::path::PathBuf,
    cancel: CancellationToken,
) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path, &cancel))
        .await
        .map_err(|e| Error::Internal(format!("hash task join: {e}")))?
}
