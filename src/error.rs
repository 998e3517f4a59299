//! Core error types.
//!
//! The library surfaces a closed set of error kinds so callers can react by
//! kind instead of string-matching. The binary and tests wrap these in
//! `anyhow` where convenient.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The referenced item does not exist. Idempotent operations
    /// (pin/unpin/delete/clear) treat this as success at the facade.
    #[error("item not found")]
    NotFound,

    /// Writer acquire exceeded the busy timeout (retried once internally).
    #[error("database busy")]
    DbBusy,

    /// The database could not be opened.
    #[error("database open failed: {0}")]
    DbOpen(String),

    /// The store returned malformed data or failed an integrity check.
    /// Fatal: the facade refuses further writes once this is seen.
    #[error("database corrupt: {0}")]
    DbCorrupt(String),

    /// The filesystem is out of space.
    #[error("disk full")]
    DiskFull,

    /// A filesystem operation on a blob or the database failed.
    #[error("io failed: {0}")]
    IoFailed(String),

    /// A query exceeded its deadline. Caches are left untouched.
    #[error("operation timed out")]
    Timeout,

    /// The request was cancelled upstream. Caches are left untouched.
    #[error("operation cancelled")]
    Cancelled,

    /// The regex pattern failed to compile.
    #[error("regex compile error: {0}")]
    RegexCompile(String),

    /// Invariant breach or unexpected backend failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI surface.
    /// 0 success, 1 bad args (clap handles that), 2 DB error, 3 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Timeout | Error::Cancelled => 3,
            _ => 2,
        }
    }

    /// True for errors that poison the store (no further writes accepted).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DbCorrupt(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(f, msg) => match f.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::DbBusy,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Error::DbCorrupt(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                ErrorCode::DiskFull => Error::DiskFull,
                ErrorCode::OperationInterrupted => Error::Cancelled,
                ErrorCode::CannotOpen => Error::DbOpen(e.to_string()),
                ErrorCode::SystemIoFailure => Error::IoFailed(e.to_string()),
                _ => Error::Internal(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.raw_os_error() == Some(libc_enospc()) {
            Error::DiskFull
        } else {
            Error::IoFailed(e.to_string())
        }
    }
}

/// ENOSPC without pulling in libc: the value is 28 on every unix we target,
/// and the probe is best-effort on other platforms.
#[cfg(unix)]
fn libc_enospc() -> i32 {
    28
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    // Windows reports ERROR_DISK_FULL (112) as the raw OS error.
    112
}
