//! Row types returned by the detection store, plus the timestamp codec used
//! for the `timestamp` column.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};
use crate::pose::PersonDetection;

/// Seconds since `last_seen` within which a camera counts as live.
pub const LIVE_WINDOW_SECS: i64 = 3600;

/// One persisted frame's worth of detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    pub camera_name: String,
    pub timestamp: String,
    pub frame_number: u64,
    pub video_timestamp: f64,
    pub detection_data: Vec<PersonDetection>,
    pub created_at: String,
}

/// Input for `DetectionStore::save_detection`.
#[derive(Clone, Debug)]
pub struct NewDetection {
    pub camera_name: String,
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    pub video_timestamp: f64,
    pub detections: Vec<PersonDetection>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Live,
    Offline,
}

impl CameraStatus {
    /// Live when `last_seen` parses and lies within the last hour of `now`.
    pub fn from_last_seen(last_seen: &str, now: DateTime<Utc>) -> Self {
        match parse_timestamp(last_seen) {
            Ok(seen) if now - seen <= Duration::seconds(LIVE_WINDOW_SECS) => CameraStatus::Live,
            _ => CameraStatus::Offline,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraSummary {
    pub name: String,
    pub status: CameraStatus,
    pub last_seen: String,
    pub detection_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_detections: u64,
    pub date_range: DateRange,
    pub average_detections_per_frame: f64,
}

/// Canonical text form for stored timestamps.
///
/// Fixed-width UTC with microseconds, so lexical order matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a query timestamp.
///
/// Accepts RFC 3339 with any offset, or a naive `YYYY-MM-DDTHH:MM:SS[.f]`
/// (also with a space separator) which is read as UTC.
pub fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(StoreError::InvalidTimestamp(raw.to_string()))
}

/// Parse and re-render a query timestamp in the canonical stored form.
pub fn normalize_timestamp(raw: &str) -> StoreResult<String> {
    parse_timestamp(raw).map(format_timestamp)
}
