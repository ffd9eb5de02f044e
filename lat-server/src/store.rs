//! Experiment Store (C10): the persistent record of readings, ground truth,
//! configurations, and estimates for one experiment (§4.7, §6).
//!
//! Grounded on the source's `experiment/schema.py` table layout, backed here
//! by `sqlx` against SQLite rather than the source's Postgres connection
//! (a deliberate adaptation recorded in `DESIGN.md` — a whole Postgres
//! server is a poor fit for a single-file, single-writer experiment log).

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use lat_types::{Configuration, Estimate, GroundTruthInterval};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anchor (
                id INTEGER PRIMARY KEY,
                x REAL NOT NULL,
                y REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS distance_reading (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                anchor_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                distance REAL NOT NULL,
                ground_truth_id INTEGER,
                ground_truth_distance REAL,
                ground_truth_error REAL,
                timestamp REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ground_truth (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL,
                tag_id INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL,
                start_x REAL NOT NULL,
                start_y REAL NOT NULL,
                end_x REAL,
                end_y REAL
            );
            CREATE TABLE IF NOT EXISTS configuration (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                configuration_name TEXT NOT NULL,
                configuration_text TEXT NOT NULL,
                locmod_name TEXT NOT NULL,
                locmod_text TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS estimate (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag_id INTEGER NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                timestamp REAL NOT NULL,
                ground_truth_id INTEGER,
                error REAL,
                configuration_id INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── readings ─────────────────────────────────────────────────────────

    pub async fn add_reading(
        &self,
        anchor_id: u32,
        tag_id: u32,
        distance: f64,
        timestamp: f64,
        ground_truth_id: Option<u32>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO distance_reading (anchor_id, tag_id, distance, ground_truth_id, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(anchor_id)
        .bind(tag_id)
        .bind(distance)
        .bind(ground_truth_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Every reading in timestamp order, as the wire-format `Reading` the
    /// live pipeline would have seen — used by the replay driver to re-feed
    /// the batch assembler deterministically (§2).
    pub async fn all_readings(&self) -> Result<Vec<lat_types::Reading>, StoreError> {
        let rows = sqlx::query(
            "SELECT anchor_id, tag_id, distance, timestamp FROM distance_reading \
             ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| lat_types::Reading {
                anchor_id: r.get::<i64, _>(0) as u32,
                tag_id: r.get::<i64, _>(1) as u32,
                distance: r.get(2),
                error_code: 0,
                timestamp: r.get(3),
            })
            .collect())
    }

    pub async fn anchors(&self) -> Result<Vec<lat_types::Anchor>, StoreError> {
        let rows = sqlx::query("SELECT id, x, y FROM anchor")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| lat_types::Anchor {
                id: r.get::<i64, _>(0) as u32,
                x: r.get(1),
                y: r.get(2),
            })
            .collect())
    }

    // ── anchors ──────────────────────────────────────────────────────────

    pub async fn add_anchor(&self, id: u32, point: (f64, f64)) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO anchor (id, x, y) VALUES (?, ?, ?)")
            .bind(id)
            .bind(point.0)
            .bind(point.1)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moving an anchor invalidates every previously computed ground-truth
    /// distance for it; those rows are nulled, not deleted (§4.7).
    pub async fn update_anchor(&self, id: u32, point: (f64, f64)) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE anchor SET x = ?, y = ? WHERE id = ?")
            .bind(point.0)
            .bind(point.1)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE distance_reading SET ground_truth_distance = NULL, ground_truth_error = NULL \
             WHERE anchor_id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ── ground truth ─────────────────────────────────────────────────────

    pub async fn start_ground_truth(
        &self,
        tag_id: u32,
        timestamp: f64,
        label: &str,
        point: (f64, f64),
    ) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "INSERT INTO ground_truth (label, tag_id, start_time, start_x, start_y) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(label)
        .bind(tag_id)
        .bind(timestamp)
        .bind(point.0)
        .bind(point.1)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid() as u32)
    }

    pub async fn end_ground_truth(
        &self,
        id: u32,
        end_time: f64,
        end_point: Option<(f64, f64)>,
        label: Option<&str>,
    ) -> Result<(), StoreError> {
        let (end_x, end_y) = match end_point {
            Some((x, y)) => (Some(x), Some(y)),
            None => (None, None),
        };
        if let Some(label) = label {
            sqlx::query(
                "UPDATE ground_truth SET end_time = ?, end_x = ?, end_y = ?, label = ? WHERE id = ?",
            )
            .bind(end_time)
            .bind(end_x)
            .bind(end_y)
            .bind(label)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE ground_truth SET end_time = ?, end_x = ?, end_y = ? WHERE id = ?")
                .bind(end_time)
                .bind(end_x)
                .bind(end_y)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Cancel a pending ground-truth interval: delete the row and null out
    /// every reading/estimate that referenced it.
    pub async fn cancel_ground_truth(&self, id: u32) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE distance_reading SET ground_truth_id = NULL WHERE ground_truth_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE estimate SET ground_truth_id = NULL WHERE ground_truth_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ground_truth WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Known position for `tag_id` at `timestamp`, if exactly one ground
    /// truth interval covers it. More than one covering interval is a store
    /// integrity error, never a silent pick (§7).
    pub async fn ground_truth(
        &self,
        tag_id: u32,
        timestamp: f64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, label, tag_id, start_time, end_time, start_x, start_y, end_x, end_y \
             FROM ground_truth WHERE tag_id = ? AND start_time <= ? \
             AND (end_time IS NULL OR end_time >= ?)",
        )
        .bind(tag_id)
        .bind(timestamp)
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(StoreError::AmbiguousGroundTruth { tag_id, timestamp });
        }
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let interval = row_to_interval(&row);
        Ok(Some(interval.location_at(timestamp)))
    }

    /// Fill in `ground_truth_id`/`ground_truth_distance`/`ground_truth_error`
    /// for every reading whose timestamp falls inside a ground-truth
    /// interval for its tag (§4.7).
    pub async fn append_ground_truth_distances(&self) -> Result<u32, StoreError> {
        let anchors = sqlx::query("SELECT id, x, y FROM anchor")
            .fetch_all(&self.pool)
            .await?;
        let anchor_points: Vec<(i64, f64, f64)> = anchors
            .iter()
            .map(|r| (r.get::<i64, _>(0), r.get::<f64, _>(1), r.get::<f64, _>(2)))
            .collect();

        let intervals = sqlx::query(
            "SELECT id, label, tag_id, start_time, end_time, start_x, start_y, end_x, end_y \
             FROM ground_truth",
        )
        .fetch_all(&self.pool)
        .await?;
        let intervals: Vec<GroundTruthInterval> = intervals.iter().map(row_to_interval).collect();

        let readings = sqlx::query(
            "SELECT id, anchor_id, tag_id, timestamp FROM distance_reading \
             WHERE ground_truth_distance IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut updated = 0u32;
        for reading in readings {
            let reading_id: i64 = reading.get(0);
            let anchor_id: i64 = reading.get(1);
            let tag_id: i64 = reading.get(2);
            let timestamp: f64 = reading.get(3);

            let Some(interval) = intervals
                .iter()
                .find(|iv| iv.tag_id as i64 == tag_id && iv.contains(timestamp))
            else {
                continue;
            };
            let Some(&(_, ax, ay)) = anchor_points.iter().find(|(id, _, _)| *id == anchor_id)
            else {
                continue;
            };

            let (gx, gy) = interval.location_at(timestamp);
            let ground_truth_distance = lat_types::euclid((ax, ay), (gx, gy));

            sqlx::query(
                "UPDATE distance_reading SET ground_truth_id = ?, ground_truth_distance = ?, \
                 ground_truth_error = (distance - ?) WHERE id = ?",
            )
            .bind(interval.id)
            .bind(ground_truth_distance)
            .bind(ground_truth_distance)
            .bind(reading_id)
            .execute(&self.pool)
            .await?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Group readings into rounds by timestamp-ordered table scan: a round
    /// boundary is crossed when the incoming anchor_id is not greater than
    /// the smallest anchor_id accumulated so far this round — the store's
    /// scan re-derives rounds independently of the live burst assembler's
    /// "last recorded anchor_id" rule (§4.7, §9).
    pub async fn observations(
        &self,
    ) -> Result<Vec<(u32, std::collections::HashMap<u32, f64>, (f64, f64), f64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT anchor_id, tag_id, distance, timestamp, ground_truth_id \
             FROM distance_reading ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        let mut current_tag: Option<i64> = None;
        let mut current: std::collections::HashMap<u32, f64> = std::collections::HashMap::new();
        let mut min_anchor_this_round: Option<i64> = None;
        let mut last_timestamp = 0.0;
        let mut last_ground_truth: Option<i64> = None;

        let flush = |out: &mut Vec<_>,
                          tag: i64,
                          distances: std::collections::HashMap<u32, f64>,
                          timestamp: f64,
                          ground_truth_id: Option<i64>| {
            if !distances.is_empty() {
                out.push((tag, distances, timestamp, ground_truth_id));
            }
        };

        for row in &rows {
            let anchor_id: i64 = row.get(0);
            let tag_id: i64 = row.get(1);
            let distance: f64 = row.get(2);
            let timestamp: f64 = row.get(3);
            let ground_truth_id: Option<i64> = row.get(4);

            let starts_new_round = match (current_tag, min_anchor_this_round) {
                (Some(t), Some(min_anchor)) if t == tag_id => anchor_id <= min_anchor,
                (Some(t), _) => t != tag_id,
                (None, _) => false,
            };

            if starts_new_round {
                if let Some(tag) = current_tag {
                    flush(
                        &mut out,
                        tag,
                        std::mem::take(&mut current),
                        last_timestamp,
                        last_ground_truth,
                    );
                }
                min_anchor_this_round = None;
            }

            current_tag = Some(tag_id);
            current.insert(anchor_id as u32, distance);
            min_anchor_this_round = Some(min_anchor_this_round.map_or(anchor_id, |m| m.min(anchor_id)));
            last_timestamp = timestamp;
            last_ground_truth = ground_truth_id;
        }
        if let Some(tag) = current_tag {
            flush(&mut out, tag, current, last_timestamp, last_ground_truth);
        }

        // Resolve ground truth points and skip rounds without one.
        let mut result = Vec::new();
        for (tag, distances, timestamp, ground_truth_id) in out {
            let Some(gid) = ground_truth_id else {
                continue;
            };
            let Some(row) = sqlx::query(
                "SELECT id, label, tag_id, start_time, end_time, start_x, start_y, end_x, end_y \
                 FROM ground_truth WHERE id = ?",
            )
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?
            else {
                continue;
            };
            let interval = row_to_interval(&row);
            let point = interval.location_at(timestamp);
            result.push((tag as u32, distances, point, timestamp));
        }
        Ok(result)
    }

    // ── configurations & estimates ───────────────────────────────────────

    pub async fn register_configuration(
        &self,
        configuration_name: &str,
        configuration_text: &str,
        locmod_name: &str,
        locmod_text: &str,
    ) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "INSERT INTO configuration (configuration_name, configuration_text, locmod_name, locmod_text) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(configuration_name)
        .bind(configuration_text)
        .bind(locmod_name)
        .bind(locmod_text)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid() as u32)
    }

    pub async fn add_estimate(
        &self,
        configuration_id: Option<u32>,
        tag_id: u32,
        point: (f64, f64),
        timestamp: f64,
        ground_truth_id: Option<u32>,
        error: Option<f64>,
    ) -> Result<i64, StoreError> {
        let configuration_id = configuration_id.ok_or(StoreError::NoConfigurationRegistered)?;
        let result = sqlx::query(
            "INSERT INTO estimate (tag_id, x, y, timestamp, ground_truth_id, error, configuration_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tag_id)
        .bind(point.0)
        .bind(point.1)
        .bind(timestamp)
        .bind(ground_truth_id)
        .bind(error)
        .bind(configuration_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Look up a previously registered configuration row, e.g. to re-use its
    /// locmod text for a reproducing replay run.
    pub async fn configuration(&self, id: u32) -> Result<Option<Configuration>, StoreError> {
        let row = sqlx::query(
            "SELECT id, configuration_name, configuration_text, locmod_name, locmod_text \
             FROM configuration WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Configuration {
            id: r.get::<i64, _>(0) as u32,
            configuration_name: r.get(1),
            configuration_text: r.get(2),
            locmod_name: r.get(3),
            locmod_text: r.get(4),
        }))
    }

    /// Every estimate written under `configuration_id`, in persistence
    /// order — used to check replay determinism byte-for-byte (§8 scenario 6).
    pub async fn estimates(&self, configuration_id: u32) -> Result<Vec<Estimate>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tag_id, x, y, timestamp, ground_truth_id, error, configuration_id \
             FROM estimate WHERE configuration_id = ? ORDER BY id ASC",
        )
        .bind(configuration_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Estimate {
                id: r.get::<i64, _>(0) as u32,
                tag_id: r.get::<i64, _>(1) as u32,
                x: r.get(2),
                y: r.get(3),
                timestamp: r.get(4),
                ground_truth_id: r.get::<Option<i64>, _>(5).map(|v| v as u32),
                error: r.get(6),
                configuration_id: r.get::<i64, _>(7) as u32,
            })
            .collect())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_interval(row: &sqlx::sqlite::SqliteRow) -> GroundTruthInterval {
    let end_time: Option<f64> = row.get(4);
    let end_x: Option<f64> = row.get(7);
    let end_y: Option<f64> = row.get(8);
    GroundTruthInterval {
        id: row.get::<i64, _>(0) as u32,
        label: row.get(1),
        tag_id: row.get::<i64, _>(2) as u32,
        start_time: row.get(3),
        end_time,
        start_point: (row.get(5), row.get(6)),
        end_point: match (end_x, end_y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        },
    }
}

/// Merge `srcs` into `dst`: anchors must agree within 1 cm across every
/// source, and ground-truth ids are remapped to avoid collisions (§4.7,
/// grounded on the source's `combine_experiments.py`).
pub async fn combine(dst: &Store, srcs: &[&Store]) -> Result<(), StoreError> {
    const ANCHOR_TOLERANCE: f64 = 0.01;

    let dst_anchors: Vec<(i64, f64, f64)> = sqlx::query("SELECT id, x, y FROM anchor")
        .fetch_all(&dst.pool)
        .await?
        .iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect();

    for src in srcs {
        let src_anchors: Vec<(i64, f64, f64)> = sqlx::query("SELECT id, x, y FROM anchor")
            .fetch_all(&src.pool)
            .await?
            .iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect();

        for (id, x, y) in &src_anchors {
            match dst_anchors.iter().find(|(did, _, _)| did == id) {
                Some((_, dx, dy)) => {
                    if (dx - x).abs() > ANCHOR_TOLERANCE || (dy - y).abs() > ANCHOR_TOLERANCE {
                        return Err(StoreError::AnchorMismatch {
                            anchor_id: *id as u32,
                            a: (*dx, *dy),
                            b: (*x, *y),
                        });
                    }
                }
                None => {
                    dst.add_anchor(*id as u32, (*x, *y)).await?;
                }
            }
        }

        let ground_truths = sqlx::query(
            "SELECT id, label, tag_id, start_time, end_time, start_x, start_y, end_x, end_y \
             FROM ground_truth",
        )
        .fetch_all(&src.pool)
        .await?;

        let mut id_remap = std::collections::HashMap::new();
        for row in &ground_truths {
            let old_id: i64 = row.get(0);
            let interval = row_to_interval(row);
            let new_id = dst
                .start_ground_truth(interval.tag_id, interval.start_time, &interval.label, interval.start_point)
                .await?;
            if let (Some(end_time), end_point) = (interval.end_time, interval.end_point) {
                dst.end_ground_truth(new_id, end_time, end_point, None).await?;
            }
            id_remap.insert(old_id, new_id);
        }

        let readings = sqlx::query(
            "SELECT anchor_id, tag_id, distance, ground_truth_id, timestamp FROM distance_reading",
        )
        .fetch_all(&src.pool)
        .await?;
        for row in &readings {
            let anchor_id: i64 = row.get(0);
            let tag_id: i64 = row.get(1);
            let distance: f64 = row.get(2);
            let ground_truth_id: Option<i64> = row.get(3);
            let timestamp: f64 = row.get(4);
            let remapped = ground_truth_id.and_then(|g| id_remap.get(&g).copied());
            dst.add_reading(
                anchor_id as u32,
                tag_id as u32,
                distance,
                timestamp,
                remapped.map(|v| v as u32),
            )
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store { pool };
        store.create_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn round_trips_an_anchor_and_reading() {
        let store = memory_store().await;
        store.add_anchor(1, (0.0, 0.0)).await.unwrap();
        let id = store.add_reading(1, 7, 3.5, 100.0, None).await.unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn ground_truth_lookup_resolves_dynamic_interpolation() {
        let store = memory_store().await;
        let gid = store
            .start_ground_truth(7, 0.0, "A>B", (0.0, 0.0))
            .await
            .unwrap();
        store
            .end_ground_truth(gid, 10.0, Some((10.0, 0.0)), None)
            .await
            .unwrap();
        let point = store.ground_truth(7, 5.0).await.unwrap().unwrap();
        assert_eq!(point, (5.0, 0.0));
    }

    #[tokio::test]
    async fn cancel_ground_truth_nulls_references() {
        let store = memory_store().await;
        let gid = store
            .start_ground_truth(7, 0.0, "A", (1.0, 1.0))
            .await
            .unwrap();
        store.add_reading(1, 7, 2.0, 1.0, Some(gid)).await.unwrap();
        store.cancel_ground_truth(gid).await.unwrap();
        assert_eq!(store.ground_truth(7, 1.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn add_estimate_without_configuration_errors() {
        let store = memory_store().await;
        let result = store.add_estimate(None, 7, (1.0, 1.0), 0.0, None, None).await;
        assert!(matches!(result, Err(StoreError::NoConfigurationRegistered)));
    }

    #[tokio::test]
    async fn register_configuration_then_add_estimate_succeeds() {
        let store = memory_store().await;
        let config_id = store
            .register_configuration("c1", "text", "locmod1", "locmod text")
            .await
            .unwrap();
        let id = store
            .add_estimate(Some(config_id), 7, (1.0, 1.0), 0.0, None, None)
            .await
            .unwrap();
        assert!(id > 0);
    }
}
