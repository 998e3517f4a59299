//! Shared utility functions

use std::time::{SystemTime, UNIX_EPOCH};

/// Clamp a string to a byte budget without splitting a UTF-8 sequence.
///
/// Returns the longest prefix of `s` that fits in `max_bytes`; when the
/// budget lands inside a multi-byte character the cut retreats to the
/// previous character boundary, so the slice is always valid UTF-8.
///
/// ```
/// use clipkeep::util::truncate_utf8_safe;
///
/// let s = "a→b"; // '→' occupies bytes 1..4
/// assert_eq!(truncate_utf8_safe(s, 3), "a");
/// assert_eq!(truncate_utf8_safe(s, 4), "a→");
/// ```
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = max_bytes;
    // Position 0 is always a boundary, so this terminates.
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Take the trailing `max_bytes` of a string, aligned to a UTF-8 boundary.
///
/// The counterpart of [`truncate_utf8_safe`] used when building head+tail
/// summaries of oversized text: a cut inside a multi-byte character moves
/// forward, shortening the tail rather than corrupting it.
pub fn tail_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = s.len() - max_bytes;
    while cut < s.len() && !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}

/// Current wall-clock time as real-valued seconds since the Unix epoch.
///
/// Item timestamps (`created_at`, `last_used_at`) are stored in this form.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
