//! Typed detection queries on top of the connection pool.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{StoreError, StoreResult};
use super::pool::ConnectionPool;
use super::record::{
    format_timestamp, normalize_timestamp, parse_timestamp, CameraStatus, CameraSummary,
    DateRange, Detection, DetectionStats, NewDetection,
};
use crate::pose::PersonDetection;

const SELECT_COLUMNS: &str = "SELECT id, camera_name, timestamp, frame_number, video_timestamp, \
                              detection_data, created_at FROM detections";

/// Detection persistence. Every operation checks a connection out of the
/// pool for its duration only.
pub struct DetectionStore {
    pool: ConnectionPool,
}

impl DetectionStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Build a store with its own pool and initialize it.
    pub fn open(db_path: &str, pool_size: usize) -> StoreResult<Self> {
        let store = Self::new(ConnectionPool::new(db_path, pool_size));
        store.pool.initialize()?;
        Ok(store)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Append one record and return its id. Records are never overwritten.
    pub fn save_detection(&self, record: &NewDetection) -> StoreResult<i64> {
        if record.detections.is_empty() {
            return Err(StoreError::InvalidRecord(
                "refusing to persist a frame without detections".to_string(),
            ));
        }
        for person in &record.detections {
            person.validate().map_err(StoreError::InvalidRecord)?;
        }
        let payload = serde_json::to_string(&record.detections)?;
        let frame_number = i64::try_from(record.frame_number)
            .map_err(|_| StoreError::InvalidRecord("frame_number exceeds i64".to_string()))?;
        let timestamp = format_timestamp(record.timestamp);

        self.pool.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO detections(camera_name, timestamp, frame_number, video_timestamp, detection_data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.camera_name,
                    timestamp,
                    frame_number,
                    record.video_timestamp,
                    payload
                ],
            )?;
            let id = conn.last_insert_rowid();
            log::debug!(
                "DetectionStore: saved detection {} with {} people for {}",
                id,
                record.detections.len(),
                record.camera_name
            );
            Ok(id)
        })
    }

    pub fn get_detection_by_id(&self, id: i64) -> StoreResult<Option<Detection>> {
        self.pool.with_connection(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
            let raw = conn
                .query_row(&sql, params![id], RawDetection::from_row)
                .optional()?;
            raw.map(RawDetection::into_detection).transpose()
        })
    }

    /// Records for `camera` with `start <= timestamp <= end`, oldest first,
    /// truncated to `limit` after ordering.
    pub fn get_detections_by_timerange(
        &self,
        camera: &str,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Detection>> {
        let start = normalize_timestamp(start)?;
        let end = normalize_timestamp(end)?;
        self.pool.with_connection(|conn| {
            query_detections(
                conn,
                &format!(
                    "{SELECT_COLUMNS} WHERE camera_name = ?1 AND timestamp BETWEEN ?2 AND ?3 \
                     ORDER BY timestamp ASC, id ASC LIMIT ?4"
                ),
                params![camera, start, end, sql_limit(limit)],
            )
        })
    }

    /// The record for `camera` closest in time to `timestamp`.
    pub fn get_nearest_detection(
        &self,
        camera: &str,
        timestamp: &str,
    ) -> StoreResult<Option<Detection>> {
        let target = normalize_timestamp(timestamp)?;
        self.pool.with_connection(|conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE camera_name = ?1 \
                 ORDER BY ABS(julianday(timestamp) - julianday(?2)) ASC, id ASC LIMIT 1"
            );
            let raw = conn
                .query_row(&sql, params![camera, target], RawDetection::from_row)
                .optional()?;
            raw.map(RawDetection::into_detection).transpose()
        })
    }

    /// Nearest record, or `None` when it lies more than `tolerance_seconds`
    /// away from `timestamp`.
    pub fn get_nearest_detection_with_tolerance(
        &self,
        camera: &str,
        timestamp: &str,
        tolerance_seconds: f64,
    ) -> StoreResult<Option<Detection>> {
        let target = parse_timestamp(timestamp)?;
        let Some(nearest) = self.get_nearest_detection(camera, timestamp)? else {
            return Ok(None);
        };
        let within = match parse_timestamp(&nearest.timestamp) {
            Ok(found) => seconds_between(found, target) <= tolerance_seconds,
            Err(_) => {
                log::warn!(
                    "DetectionStore: detection {} has unparsable timestamp {}",
                    nearest.id,
                    nearest.timestamp
                );
                false
            }
        };
        Ok(within.then_some(nearest))
    }

    /// Most recent `limit` records for `camera`, newest first.
    pub fn get_latest_detections(&self, camera: &str, limit: usize) -> StoreResult<Vec<Detection>> {
        self.pool.with_connection(|conn| {
            query_detections(
                conn,
                &format!(
                    "{SELECT_COLUMNS} WHERE camera_name = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2"
                ),
                params![camera, sql_limit(Some(limit))],
            )
        })
    }

    pub fn get_cameras(&self) -> StoreResult<Vec<CameraSummary>> {
        self.get_cameras_at(Utc::now())
    }

    /// Camera summaries with liveness evaluated against `now`.
    pub fn get_cameras_at(&self, now: DateTime<Utc>) -> StoreResult<Vec<CameraSummary>> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT camera_name, MAX(timestamp), COUNT(*) FROM detections \
                 GROUP BY camera_name ORDER BY camera_name ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut cameras = Vec::new();
            for row in rows {
                let (name, last_seen, count) = row?;
                cameras.push(CameraSummary {
                    status: CameraStatus::from_last_seen(&last_seen, now),
                    name,
                    last_seen,
                    detection_count: count.max(0) as u64,
                });
            }
            Ok(cameras)
        })
    }

    /// Most recent `limit` records across all cameras, oldest first.
    pub fn get_timeline_data(&self, limit: usize) -> StoreResult<Vec<Detection>> {
        let mut newest = self.pool.with_connection(|conn| {
            query_detections(
                conn,
                &format!("{SELECT_COLUMNS} ORDER BY timestamp DESC, id DESC LIMIT ?1"),
                params![sql_limit(Some(limit))],
            )
        })?;
        newest.reverse();
        Ok(newest)
    }

    /// Timeline restricted to one camera, oldest first.
    pub fn get_timeline_data_for_camera(
        &self,
        camera: &str,
        limit: usize,
    ) -> StoreResult<Vec<Detection>> {
        let mut newest = self.get_latest_detections(camera, limit)?;
        newest.reverse();
        Ok(newest)
    }

    pub fn get_detection_stats(&self) -> StoreResult<DetectionStats> {
        self.pool.with_connection(|conn| {
            let (total, start, end, average) = conn.query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp), \
                 AVG(json_array_length(detection_data)) FROM detections",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )?;
            Ok(DetectionStats {
                total_detections: total.max(0) as u64,
                date_range: DateRange { start, end },
                average_detections_per_frame: average.unwrap_or(0.0),
            })
        })
    }
}

struct RawDetection {
    id: i64,
    camera_name: String,
    timestamp: String,
    frame_number: i64,
    video_timestamp: f64,
    detection_data: String,
    created_at: String,
}

impl RawDetection {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            camera_name: row.get(1)?,
            timestamp: row.get(2)?,
            frame_number: row.get(3)?,
            video_timestamp: row.get(4)?,
            detection_data: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_detection(self) -> StoreResult<Detection> {
        let detection_data: Vec<PersonDetection> = serde_json::from_str(&self.detection_data)?;
        Ok(Detection {
            id: self.id,
            camera_name: self.camera_name,
            timestamp: self.timestamp,
            frame_number: self.frame_number.max(0) as u64,
            video_timestamp: self.video_timestamp,
            detection_data,
            created_at: self.created_at,
        })
    }
}

fn query_detections(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<Detection>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawDetection::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawDetection::into_detection).collect()
}

/// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit
        .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let delta = a - b;
    match delta.num_microseconds() {
        Some(us) => (us as f64 / 1_000_000.0).abs(),
        None => delta.num_seconds().unsigned_abs() as f64,
    }
}
