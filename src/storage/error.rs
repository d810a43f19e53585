use thiserror::Error;

/// Errors surfaced by the connection pool and the detection store.
///
/// `InvalidTimestamp` is kept distinct from "no rows" so callers can tell
/// malformed input apart from an empty result.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid timestamp '{0}': expected RFC 3339 or YYYY-MM-DDTHH:MM:SS[.f]")]
    InvalidTimestamp(String),

    #[error("invalid detection record: {0}")]
    InvalidRecord(String),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("timed out waiting for a pooled connection")]
    AcquireTimeout,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("detection payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
