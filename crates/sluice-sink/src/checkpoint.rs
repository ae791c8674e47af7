//! Replicated binlog/GTID checkpoint store.
//!
//! One [`RemoteCheckpoint`] per replication task. It tracks a global point
//! plus per-table points, each as a `(pending, flushed)` pair. Saves move
//! pending points; a [`RemoteCheckpoint::snapshot`] captures the pending
//! state under a monotonic id; [`RemoteCheckpoint::flush_points_except`]
//! persists exactly one snapshot in a single transaction and only then
//! advances the flushed points. [`RemoteCheckpoint::rollback`] discards
//! pending progress back to the flushed state.
//!
//! Persistence is one metadata table keyed by
//! `(task_id, cp_schema, cp_table)`; the `is_global = true` row carries the
//! task's global position and the safe-mode exit point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sluice_model::{BinlogPosition, GtidSet, Location, SqlValue, TableInfo, TableRef};

use crate::conn::ConnPool;
use crate::meta::DumpMeta;
use crate::SinkError;

/// Checkpoint store configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Task identity, the `id` column of every row.
    pub task_id: String,
    /// Task name, part of the checkpoint table name.
    pub task_name: String,
    /// Schema the checkpoint table lives in.
    pub meta_schema: String,
    /// Minimum interval between forced flushes.
    pub flush_interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            task_id: "task".to_string(),
            task_name: "task".to_string(),
            meta_schema: "sluice_meta".to_string(),
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// A point's data: location plus the table metadata captured with it.
#[derive(Debug, Clone, Default)]
struct PointData {
    location: Location,
    table_info: Option<Arc<TableInfo>>,
}

/// A `(pending, flushed)` point pair.
#[derive(Debug, Clone, Default)]
struct BinlogPoint {
    pending: PointData,
    flushed: PointData,
}

impl BinlogPoint {
    fn at(location: Location) -> Self {
        let data = PointData {
            location,
            table_info: None,
        };
        Self {
            pending: data.clone(),
            flushed: data,
        }
    }

    fn out_of_date(&self) -> bool {
        self.pending.location > self.flushed.location
    }

    fn rollback(&mut self) {
        self.pending = self.flushed.clone();
    }
}

/// Public identity of a created snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Monotonic snapshot id.
    pub id: u64,
    /// Whether the snapshot carries the global point.
    pub global_changed: bool,
}

/// An immutable capture of pending points staged for one flush.
#[derive(Clone)]
struct Snapshot {
    id: u64,
    global: PointData,
    include_global: bool,
    safe_mode_exit: Option<Location>,
    points: Vec<(TableRef, PointData)>,
}

#[derive(Default)]
struct State {
    global: BinlogPoint,
    points: HashMap<String, HashMap<String, BinlogPoint>>,
    safe_mode_exit: Option<Location>,
    safe_mode_exit_flushed: bool,
    /// `None` until the global point has been saved or flushed once; a
    /// forced snapshot treats that as "must flush".
    global_point_save_time: Option<Instant>,
    snapshots: Vec<Snapshot>,
    next_snapshot_id: u64,
    last_flushed_id: u64,
}

/// The replicated checkpoint store.
pub struct RemoteCheckpoint {
    cfg: CheckpointConfig,
    pool: Arc<dyn ConnPool>,
    state: Mutex<State>,
    /// Serializes every SQL-touching operation; guarantees at most one
    /// in-flight flush.
    sql_lock: tokio::sync::Mutex<()>,
    /// Epoch millis of the last successful flush; lock-free reads.
    last_flush_millis: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl RemoteCheckpoint {
    /// Create a store with all points at the minimum location.
    #[must_use]
    pub fn new(cfg: CheckpointConfig, pool: Arc<dyn ConnPool>) -> Self {
        Self {
            cfg,
            pool,
            state: Mutex::new(State::default()),
            sql_lock: tokio::sync::Mutex::new(()),
            last_flush_millis: AtomicU64::new(now_millis()),
        }
    }

    fn table_name(&self) -> String {
        format!(
            "`{}`.`{}_syncer_checkpoint`",
            self.cfg.meta_schema, self.cfg.task_name
        )
    }

    fn flush_sql(&self) -> String {
        format!(
            "INSERT INTO {} \
             (task_id, cp_schema, cp_table, binlog_name, binlog_pos, binlog_gtid, \
              exit_safe_binlog_name, exit_safe_binlog_pos, exit_safe_binlog_gtid, \
              table_info_json, is_global) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             binlog_name = VALUES(binlog_name), binlog_pos = VALUES(binlog_pos), \
             binlog_gtid = VALUES(binlog_gtid), \
             exit_safe_binlog_name = VALUES(exit_safe_binlog_name), \
             exit_safe_binlog_pos = VALUES(exit_safe_binlog_pos), \
             exit_safe_binlog_gtid = VALUES(exit_safe_binlog_gtid), \
             table_info_json = VALUES(table_info_json), is_global = VALUES(is_global)",
            self.table_name()
        )
    }

    /// Create the meta schema and checkpoint table.
    ///
    /// # Errors
    ///
    /// Propagates downstream failures.
    pub async fn prepare(&self) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;
        let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS `{}`", self.cfg.meta_schema),
            &[],
        )
        .await
        .map_err(SinkError::from)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 task_id VARCHAR(32) NOT NULL, \
                 cp_schema VARCHAR(128) NOT NULL, \
                 cp_table VARCHAR(128) NOT NULL, \
                 binlog_name VARCHAR(128), \
                 binlog_pos INT UNSIGNED, \
                 binlog_gtid TEXT, \
                 exit_safe_binlog_name VARCHAR(128) DEFAULT '', \
                 exit_safe_binlog_pos INT UNSIGNED DEFAULT 0, \
                 exit_safe_binlog_gtid TEXT, \
                 table_info_json JSON NOT NULL, \
                 is_global BOOLEAN, \
                 create_time timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 update_time timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP \
                   ON UPDATE CURRENT_TIMESTAMP, \
                 UNIQUE KEY uk_task_schema_table (task_id, cp_schema, cp_table))",
                self.table_name()
            ),
            &[],
        )
        .await
        .map_err(SinkError::from)?;
        Ok(())
    }

    // ── Point saves ─────────────────────────────────────────────────

    /// Save the global pending point. An older location is ignored with a
    /// warning; saving never flushes.
    pub fn save_global_point(&self, location: Location) {
        let mut state = self.state.lock();
        if location < state.global.pending.location {
            tracing::warn!(
                task = %self.cfg.task_id,
                saving = %location,
                current = %state.global.pending.location,
                "Try to save a global checkpoint older than the current one, ignored"
            );
            return;
        }
        state.global.pending.location = location;
    }

    /// Save a table's pending point with the table metadata in force.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvariantViolation`] when the location is older
    /// than the global pending point.
    pub fn save_table_point(
        &self,
        table: &TableRef,
        location: Location,
        table_info: Option<Arc<TableInfo>>,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if location < state.global.pending.location {
            return Err(SinkError::InvariantViolation(format!(
                "table checkpoint {} for {} is less than global checkpoint {}",
                location, table, state.global.pending.location
            )));
        }
        let point = state
            .points
            .entry(table.schema.clone())
            .or_default()
            .entry(table.table.clone())
            .or_default();
        point.pending = PointData {
            location,
            table_info,
        };
        Ok(())
    }

    /// Whether `location` is strictly older than the table's pending
    /// point. Tables without a point are never older.
    #[must_use]
    pub fn is_older_than_table_point(&self, table: &TableRef, location: &Location) -> bool {
        let state = self.state.lock();
        state
            .points
            .get(&table.schema)
            .and_then(|tables| tables.get(&table.table))
            .is_some_and(|point| *location < point.pending.location)
    }

    /// The global pending location.
    #[must_use]
    pub fn global_point(&self) -> Location {
        self.state.lock().global.pending.location.clone()
    }

    /// The global flushed location.
    #[must_use]
    pub fn flushed_global_point(&self) -> Location {
        self.state.lock().global.flushed.location.clone()
    }

    /// The safe-mode exit location, when one is known.
    #[must_use]
    pub fn safe_mode_exit_point(&self) -> Option<Location> {
        self.state.lock().safe_mode_exit.clone()
    }

    /// Epoch millis of the last successful flush. Lock-free.
    #[must_use]
    pub fn last_flush_millis(&self) -> u64 {
        self.last_flush_millis.load(Ordering::Acquire)
    }

    /// Whether the last flush is older than the configured interval.
    #[must_use]
    pub fn last_flush_outdated(&self) -> bool {
        if self.cfg.flush_interval.is_zero() {
            return false;
        }
        let last = self.last_flush_millis();
        let interval = u64::try_from(self.cfg.flush_interval.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(last) > interval
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// Capture pending points for one flush.
    ///
    /// Returns `None` when nothing needs flushing. With `forced`, a
    /// never-saved global point, an unflushed safe-mode exit point, or an
    /// outdated last flush also trigger a snapshot.
    pub fn snapshot(&self, forced: bool) -> Option<SnapshotInfo> {
        let outdated = self.last_flush_outdated();
        let mut state = self.state.lock();

        let mut points = Vec::new();
        for (schema, tables) in &state.points {
            for (table, point) in tables {
                if point.out_of_date() {
                    points.push((
                        TableRef::new(schema.clone(), table.clone()),
                        point.pending.clone(),
                    ));
                }
            }
        }

        let exit_unsaved = state.safe_mode_exit.is_some() && !state.safe_mode_exit_flushed;
        let include_global = state.global.out_of_date()
            || (forced && (state.global_point_save_time.is_none() || exit_unsaved))
            || (forced && outdated);

        if points.is_empty() && !include_global {
            return None;
        }

        state.next_snapshot_id += 1;
        let id = state.next_snapshot_id;
        let snapshot = Snapshot {
            id,
            global: state.global.pending.clone(),
            include_global,
            safe_mode_exit: state.safe_mode_exit.clone(),
            points,
        };
        state.snapshots.push(snapshot);
        Some(SnapshotInfo {
            id,
            global_changed: include_global,
        })
    }

    /// Drop every staged snapshot without flushing.
    pub fn discard_pending_snapshots(&self) {
        self.state.lock().snapshots.clear();
    }

    /// Persist snapshot `snapshot_id` in a single transaction, excluding
    /// `except_tables`, then advance the flushed points it carried.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvariantViolation`] for unknown or stale
    /// snapshot ids, and propagates downstream failures, leaving flushed
    /// state untouched.
    pub async fn flush_points_except(
        &self,
        snapshot_id: u64,
        except_tables: &[TableRef],
    ) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;

        let snapshot = {
            let state = self.state.lock();
            if snapshot_id <= state.last_flushed_id {
                return Err(SinkError::InvariantViolation(format!(
                    "flush of stale snapshot {snapshot_id}, last flushed {}",
                    state.last_flushed_id
                )));
            }
            let mut snapshot = state
                .snapshots
                .iter()
                .find(|s| s.id == snapshot_id)
                .cloned()
                .ok_or_else(|| {
                    SinkError::InvariantViolation(format!(
                        "flush of unknown snapshot {snapshot_id}"
                    ))
                })?;
            snapshot
                .points
                .retain(|(table, _)| !except_tables.contains(table));
            snapshot
        };

        let mut statements: Vec<(String, Vec<SqlValue>)> = Vec::new();
        let flush_sql = self.flush_sql();
        if snapshot.include_global {
            statements.push((
                flush_sql.clone(),
                self.global_row_params(&snapshot.global.location, snapshot.safe_mode_exit.as_ref())?,
            ));
        }
        for (table, data) in &snapshot.points {
            statements.push((flush_sql.clone(), self.table_row_params(table, data)?));
        }

        if !statements.is_empty() {
            let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
            conn.begin().await.map_err(SinkError::from)?;
            for (sql, params) in &statements {
                if let Err(e) = conn.execute(sql, params).await {
                    if let Err(rb) = conn.rollback().await {
                        tracing::warn!(task = %self.cfg.task_id, error = %rb, "Checkpoint rollback failed");
                    }
                    return Err(e.into());
                }
            }
            conn.commit().await.map_err(SinkError::from)?;
        }

        let mut state = self.state.lock();
        if snapshot.include_global {
            state.global.flushed = snapshot.global.clone();
            state.global_point_save_time = Some(Instant::now());
            if snapshot.safe_mode_exit.is_some() {
                state.safe_mode_exit_flushed = true;
            }
        }
        for (table, data) in snapshot.points {
            if let Some(point) = state
                .points
                .get_mut(&table.schema)
                .and_then(|tables| tables.get_mut(&table.table))
            {
                point.flushed = data;
            }
        }
        state.last_flushed_id = snapshot.id;
        state.snapshots.retain(|s| s.id > snapshot.id);
        drop(state);

        self.last_flush_millis.store(now_millis(), Ordering::Release);
        tracing::info!(
            task = %self.cfg.task_id,
            snapshot_id,
            "Checkpoint flushed"
        );
        Ok(())
    }

    /// Discard all pending progress: every pending point returns to its
    /// flushed value.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        state.global.rollback();
        for tables in state.points.values_mut() {
            for point in tables.values_mut() {
                point.rollback();
            }
        }
    }

    // ── Load / bootstrap ────────────────────────────────────────────

    /// Load every persisted row of the task. With no rows, all points stay
    /// at the minimum.
    ///
    /// # Errors
    ///
    /// Propagates downstream failures and row-parse errors.
    pub async fn load(&self) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;
        let rows = {
            let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
            conn.query(
                &format!(
                    "SELECT cp_schema, cp_table, binlog_name, binlog_pos, binlog_gtid, \
                     exit_safe_binlog_name, exit_safe_binlog_pos, exit_safe_binlog_gtid, \
                     table_info_json, is_global FROM {} WHERE task_id = ?",
                    self.table_name()
                ),
                &[SqlValue::Text(self.cfg.task_id.clone())],
            )
            .await
            .map_err(SinkError::from)?
        };

        let mut state = self.state.lock();
        state.global = BinlogPoint::default();
        state.points.clear();
        state.safe_mode_exit = None;
        state.safe_mode_exit_flushed = false;
        state.global_point_save_time = None;

        for row in rows {
            if row.len() < 10 {
                return Err(SinkError::InvariantViolation(format!(
                    "checkpoint row has {} columns, want 10",
                    row.len()
                )));
            }
            let schema = value_to_string(&row[0]);
            let table = value_to_string(&row[1]);
            let location = Location {
                position: BinlogPosition::new(value_to_string(&row[2]), value_to_u32(&row[3])),
                gtid_set: parse_gtid(&value_to_string(&row[4]))?,
            };
            let is_global = value_to_bool(&row[9]);

            if is_global {
                state.global = BinlogPoint::at(location);
                state.global_point_save_time = Some(Instant::now());
                let exit_name = value_to_string(&row[5]);
                if !exit_name.is_empty() {
                    state.safe_mode_exit = Some(Location {
                        position: BinlogPosition::new(exit_name, value_to_u32(&row[6])),
                        gtid_set: parse_gtid(&value_to_string(&row[7]))?,
                    });
                    state.safe_mode_exit_flushed = true;
                }
            } else {
                let table_info = parse_table_info(&value_to_string(&row[8]))?;
                let data = PointData {
                    location,
                    table_info,
                };
                state.points.entry(schema).or_default().insert(
                    table,
                    BinlogPoint {
                        pending: data.clone(),
                        flushed: data,
                    },
                );
            }
        }
        Ok(())
    }

    /// Bootstrap the global point from dumper metadata. The next forced
    /// snapshot flushes the bootstrapped point.
    pub fn load_meta(&self, meta: &DumpMeta) {
        let mut state = self.state.lock();
        state.global = BinlogPoint::at(meta.location.clone());
        state.safe_mode_exit = meta.exit_safe_location.clone();
        state.safe_mode_exit_flushed = false;
        state.global_point_save_time = None;
        tracing::info!(
            task = %self.cfg.task_id,
            location = %meta.location,
            has_exit_safe = meta.exit_safe_location.is_some(),
            "Loaded checkpoint from dump metadata"
        );
    }

    // ── Deletes ─────────────────────────────────────────────────────

    /// Delete a table's persisted point in its own transaction.
    ///
    /// # Errors
    ///
    /// Propagates downstream failures.
    pub async fn delete_table_point(&self, table: &TableRef) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;
        let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
        conn.begin().await.map_err(SinkError::from)?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE task_id = ? AND cp_schema = ? AND cp_table = ?",
                self.table_name()
            ),
            &[
                SqlValue::Text(self.cfg.task_id.clone()),
                SqlValue::Text(table.schema.clone()),
                SqlValue::Text(table.table.clone()),
            ],
        )
        .await
        .map_err(SinkError::from)?;
        conn.commit().await.map_err(SinkError::from)?;

        let mut state = self.state.lock();
        if let Some(tables) = state.points.get_mut(&table.schema) {
            tables.remove(&table.table);
        }
        Ok(())
    }

    /// Delete every persisted point of a schema in its own transaction.
    ///
    /// # Errors
    ///
    /// Propagates downstream failures.
    pub async fn delete_schema_point(&self, schema: &str) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;
        let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
        conn.begin().await.map_err(SinkError::from)?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE task_id = ? AND cp_schema = ?",
                self.table_name()
            ),
            &[
                SqlValue::Text(self.cfg.task_id.clone()),
                SqlValue::Text(schema.to_string()),
            ],
        )
        .await
        .map_err(SinkError::from)?;
        conn.commit().await.map_err(SinkError::from)?;

        self.state.lock().points.remove(schema);
        Ok(())
    }

    /// Delete every row of the task and reset all points to the minimum.
    ///
    /// # Errors
    ///
    /// Propagates downstream failures.
    pub async fn clear(&self) -> Result<(), SinkError> {
        let _guard = self.sql_lock.lock().await;
        let mut conn = self.pool.acquire().await.map_err(SinkError::from)?;
        conn.begin().await.map_err(SinkError::from)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE task_id = ?", self.table_name()),
            &[SqlValue::Text(self.cfg.task_id.clone())],
        )
        .await
        .map_err(SinkError::from)?;
        conn.commit().await.map_err(SinkError::from)?;

        let mut state = self.state.lock();
        state.global = BinlogPoint::default();
        state.points.clear();
        state.safe_mode_exit = None;
        state.safe_mode_exit_flushed = false;
        state.global_point_save_time = None;
        state.snapshots.clear();
        Ok(())
    }

    // ── Row building ────────────────────────────────────────────────

    fn global_row_params(
        &self,
        location: &Location,
        exit_safe: Option<&Location>,
    ) -> Result<Vec<SqlValue>, SinkError> {
        let (exit_name, exit_pos, exit_gtid) = exit_safe.map_or_else(
            || (String::new(), 0_u32, String::new()),
            |loc| {
                (
                    loc.position.name.clone(),
                    loc.position.pos,
                    gtid_text(loc),
                )
            },
        );
        Ok(vec![
            SqlValue::Text(self.cfg.task_id.clone()),
            SqlValue::Text(String::new()),
            SqlValue::Text(String::new()),
            SqlValue::Text(location.position.name.clone()),
            SqlValue::UInt(u64::from(location.position.pos)),
            SqlValue::Text(gtid_text(location)),
            SqlValue::Text(exit_name),
            SqlValue::UInt(u64::from(exit_pos)),
            SqlValue::Text(exit_gtid),
            SqlValue::Text("null".to_string()),
            SqlValue::Int(1),
        ])
    }

    fn table_row_params(
        &self,
        table: &TableRef,
        data: &PointData,
    ) -> Result<Vec<SqlValue>, SinkError> {
        let table_info_json = match &data.table_info {
            Some(info) => serde_json::to_string(info.as_ref())?,
            None => "null".to_string(),
        };
        Ok(vec![
            SqlValue::Text(self.cfg.task_id.clone()),
            SqlValue::Text(table.schema.clone()),
            SqlValue::Text(table.table.clone()),
            SqlValue::Text(data.location.position.name.clone()),
            SqlValue::UInt(u64::from(data.location.position.pos)),
            SqlValue::Text(gtid_text(&data.location)),
            SqlValue::Text(String::new()),
            SqlValue::UInt(0),
            SqlValue::Text(String::new()),
            SqlValue::Text(table_info_json),
            SqlValue::Int(0),
        ])
    }
}

fn gtid_text(location: &Location) -> String {
    location
        .gtid_set
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn parse_gtid(text: &str) -> Result<Option<GtidSet>, SinkError> {
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(GtidSet::parse(text)?))
}

fn parse_table_info(text: &str) -> Result<Option<Arc<TableInfo>>, SinkError> {
    if text.is_empty() || text == "null" {
        return Ok(None);
    }
    Ok(Some(Arc::new(serde_json::from_str(text)?)))
}

fn value_to_string(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s.clone(),
        SqlValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::UInt(v) => v.to_string(),
        SqlValue::Double(v) => v.to_string(),
        SqlValue::Null => String::new(),
    }
}

fn value_to_u32(value: &SqlValue) -> u32 {
    match value {
        SqlValue::Int(v) => u32::try_from(*v).unwrap_or(0),
        SqlValue::UInt(v) => u32::try_from(*v).unwrap_or(0),
        SqlValue::Text(s) => s.parse().unwrap_or(0),
        SqlValue::Bytes(b) => String::from_utf8_lossy(b).parse().unwrap_or(0),
        _ => 0,
    }
}

fn value_to_bool(value: &SqlValue) -> bool {
    match value {
        SqlValue::Int(v) => *v != 0,
        SqlValue::UInt(v) => *v != 0,
        SqlValue::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
