//! Detection persistence.
//!
//! - `pool`: bounded SQLite connection pool, owns the schema
//! - `store`: typed queries (insert, range, nearest, latest, cameras, timeline, stats)
//! - `record`: row types and the canonical timestamp codec

mod error;
pub mod pool;
pub mod record;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use pool::{ConnectionPool, PooledConnection, DEFAULT_POOL_SIZE};
pub use record::{
    format_timestamp, normalize_timestamp, parse_timestamp, CameraStatus, CameraSummary,
    DateRange, Detection, DetectionStats, NewDetection, LIVE_WINDOW_SECS,
};
pub use store::DetectionStore;
