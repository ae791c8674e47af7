//! Transactional DML batching backend.
//!
//! One backend per sink worker. Transaction events accumulate in a buffer
//! until a flush is due (`wait_flush` hint or the row threshold); a flush
//! converts the buffered rows into SQL, executes everything in one
//! downstream transaction with retry, and only then invokes the events'
//! completion callbacks in accept order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_model::{Column, RowChange, SqlValue, Ts, TxnCallback, TxnCallbackableEvent};

use crate::conn::{ConnPool, DbErrorKind, SinkConn};
use crate::sqlgen::{
    gen_delete_sql, gen_insert_sql, gen_update_sql_fast, has_handle_key, interpolate_sql,
    prepare_delete, prepare_replace, prepare_update, reduce_replace, InsertKind, ReplaceCache,
};
use crate::SinkError;

/// Slack added to every statement deadline for network round-trips.
const NETWORK_DRIFT: Duration = Duration::from_secs(5);

/// Reallocate the event buffer when its capacity grows past this.
const BUFFER_SHRINK_CAPACITY: usize = 1024;

/// Sink backend configuration. Field names match the replication config
/// surface.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Sink worker count, also the connection pool size.
    pub worker_count: usize,
    /// Row threshold forcing a flush; also the INSERT/DELETE batching cap.
    pub max_txn_row: usize,
    /// UPDATE batching cap.
    pub max_multi_update_row_count: usize,
    /// Per-row size threshold switching multi-row UPDATE to per-row.
    pub max_multi_update_row_size: usize,
    /// Coalesce INSERTs into multi-VALUES REPLACE statements.
    pub batch_replace_enabled: bool,
    /// Tuples per coalesced REPLACE.
    pub batch_replace_size: usize,
    /// Allow grouped INSERT/UPDATE/DELETE batch statements.
    pub batch_dml_enable: bool,
    /// Concatenate all DMLs into one round-trip.
    pub multi_stmt_enable: bool,
    /// Force REPLACE instead of INSERT.
    pub safe_mode: bool,
    /// Old-value capture is enabled upstream; required for UPDATE events.
    pub enable_old_value: bool,
    /// Replicate tables without a usable unique key by matching all
    /// columns.
    pub force_replicate: bool,
    /// Downstream is TiDB; multi-row UPDATE is only used there.
    pub is_tidb: bool,
    /// Downstream accepts the CDC write-source session variable.
    pub write_source_available: bool,
    /// Identity written as the transaction source.
    pub source_id: u64,
    /// Per-statement deadline base.
    pub write_timeout: Duration,
    /// Retry ceiling for a flush.
    pub dml_max_retry: usize,
    /// First retry backoff.
    pub backoff_base_delay: Duration,
    /// Backoff ceiling.
    pub backoff_max_delay: Duration,
    /// Downstream `max_allowed_packet`, probed at startup.
    pub max_allowed_packet: i64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            max_txn_row: 256,
            max_multi_update_row_count: 40,
            max_multi_update_row_size: 1024,
            batch_replace_enabled: true,
            batch_replace_size: 20,
            batch_dml_enable: false,
            multi_stmt_enable: false,
            safe_mode: false,
            enable_old_value: true,
            force_replicate: false,
            is_tidb: false,
            write_source_available: false,
            source_id: 1,
            write_timeout: Duration::from_secs(120),
            dml_max_retry: 8,
            backoff_base_delay: Duration::from_millis(500),
            backoff_max_delay: Duration::from_secs(60),
            max_allowed_packet: 64 * 1024 * 1024,
        }
    }
}

/// Prepared SQL for one flush: statements and arguments. Kept free of the
/// completion callbacks so it stays `Sync` when held across `.await` points
/// (a boxed `FnOnce` trait object is `Send` but not `Sync`).
struct PreparedDmls {
    start_ts: Vec<Ts>,
    sqls: Vec<String>,
    values: Vec<Vec<SqlValue>>,
    row_count: usize,
    approximate_size: i64,
}

/// One sink worker's batching backend over the shared connection pool.
pub struct MysqlBackend {
    worker_id: usize,
    changefeed: String,
    cfg: SinkConfig,
    pool: Arc<dyn ConnPool>,
    events: Vec<TxnCallbackableEvent>,
    rows: usize,
}

/// The subset of a backend's fields needed to execute a prepared flush.
/// Split out from `MysqlBackend` so DML execution doesn't hold a reference
/// to `events` (which contains non-`Sync` completion callbacks) across
/// `.await` points.
struct ExecCtx {
    worker_id: usize,
    changefeed: String,
    cfg: SinkConfig,
    pool: Arc<dyn ConnPool>,
}

impl MysqlBackend {
    /// Create a worker backend.
    #[must_use]
    pub fn new(
        worker_id: usize,
        changefeed: impl Into<String>,
        cfg: SinkConfig,
        pool: Arc<dyn ConnPool>,
    ) -> Self {
        Self {
            worker_id,
            changefeed: changefeed.into(),
            cfg,
            pool,
            events: Vec::new(),
            rows: 0,
        }
    }

    /// Buffer a transaction event. Returns whether the caller must flush
    /// now.
    pub fn on_txn_event(&mut self, event: TxnCallbackableEvent) -> bool {
        let wait_flush = event.event.to_wait_flush();
        self.rows += event.event.rows.len();
        self.events.push(event);
        wait_flush || self.rows >= self.cfg.max_txn_row
    }

    /// Rows currently buffered.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.rows
    }

    /// Flush everything buffered in one downstream transaction with
    /// retry. Callbacks fire in accept order after the commit; they are
    /// never fired on failure.
    ///
    /// # Errors
    ///
    /// Returns the terminal error after retries are exhausted or a
    /// non-retryable failure surfaces.
    pub async fn flush(&mut self) -> Result<(), SinkError> {
        if self.rows == 0 {
            return Ok(());
        }

        let (dmls, callbacks) = self.prepare_dmls();
        tracing::debug!(
            changefeed = %self.changefeed,
            worker_id = self.worker_id,
            rows = dmls.row_count,
            statements = dmls.sqls.len(),
            "Prepared DMLs"
        );

        let ctx = ExecCtx {
            worker_id: self.worker_id,
            changefeed: self.changefeed.clone(),
            cfg: self.cfg.clone(),
            pool: self.pool.clone(),
        };
        exec_dml_with_retry(&ctx, &dmls).await?;

        for callback in callbacks {
            callback();
        }

        if self.events.capacity() > BUFFER_SHRINK_CAPACITY {
            self.events = Vec::new();
        } else {
            self.events.clear();
        }
        self.rows = 0;
        Ok(())
    }

    /// Close the backend, dropping any unflushed events.
    pub fn close(&mut self) {
        self.events.clear();
        self.rows = 0;
    }

    // ── DML preparation ─────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn prepare_dmls(&mut self) -> (PreparedDmls, Vec<TxnCallback>) {
        let mut start_ts: Vec<Ts> = Vec::new();
        let mut sqls: Vec<String> = Vec::new();
        let mut values: Vec<Vec<SqlValue>> = Vec::new();
        let mut callbacks: Vec<TxnCallback> = Vec::new();
        let mut replace_cache: ReplaceCache = Vec::new();

        // INSERT is only safe when the rows are known to be absent
        // downstream: old value on, safe mode off, and every transaction
        // committed after its table began replicating.
        let mut translate_to_insert = self.cfg.enable_old_value && !self.cfg.safe_mode;

        let mut row_count = 0_usize;
        let mut approximate_size = 0_i64;

        let cfg = self.cfg.clone();
        for event in &mut self.events {
            if event.event.rows.is_empty() {
                continue;
            }
            row_count += event.event.rows.len();

            for row in &mut event.event.rows {
                convert_binary_to_string(&mut row.pre_columns);
                convert_binary_to_string(&mut row.columns);
            }

            let (first_start_ts, first_commit_ts, first_replicating_ts) = {
                let first = &event.event.rows[0];
                (first.start_ts, first.commit_ts, first.replicating_ts)
            };
            if start_ts.last() != Some(&first_start_ts) {
                start_ts.push(first_start_ts);
            }
            translate_to_insert = translate_to_insert && first_commit_ts > first_replicating_ts;

            if let Some(callback) = event.callback.take() {
                callbacks.push(callback);
            }

            if cfg.batch_dml_enable && event.event.rows.len() > 1 {
                let first = &event.event.rows[0];
                let table_columns = if first.is_delete() {
                    &first.pre_columns
                } else {
                    &first.columns
                };
                // Grouped batches are only safe with a handle key.
                if has_handle_key(table_columns) {
                    flush_cached_replaces(&cfg, &mut replace_cache, &mut sqls, &mut values);
                    let before = sqls.len();
                    batch_single_txn_dmls(
                        &cfg,
                        &event.event.rows,
                        translate_to_insert,
                        &mut sqls,
                        &mut values,
                    );
                    for sql in &sqls[before..] {
                        approximate_size += i64::try_from(sql.len()).unwrap_or(i64::MAX);
                    }
                    for row in &event.event.rows {
                        approximate_size += row.approximate_size;
                    }
                    continue;
                }
            }

            let quote_table = event.event.rows[0].table.quote_string();
            for row in &event.event.rows {
                let mut statement_len = 0_usize;
                if row.is_update() {
                    flush_cached_replaces(&cfg, &mut replace_cache, &mut sqls, &mut values);
                    if let Some((sql, args)) = prepare_update(
                        &quote_table,
                        &row.pre_columns,
                        &row.columns,
                        cfg.force_replicate,
                    ) {
                        statement_len = sql.len();
                        sqls.push(sql);
                        values.push(args);
                    }
                    approximate_size +=
                        i64::try_from(statement_len).unwrap_or(i64::MAX) + row.approximate_size;
                    continue;
                }

                if !row.pre_columns.is_empty() {
                    flush_cached_replaces(&cfg, &mut replace_cache, &mut sqls, &mut values);
                    if let Some((sql, args)) =
                        prepare_delete(&quote_table, &row.pre_columns, cfg.force_replicate)
                    {
                        statement_len = sql.len();
                        sqls.push(sql);
                        values.push(args);
                    }
                }

                if !row.columns.is_empty() {
                    if cfg.batch_replace_enabled {
                        if let Some((template, args)) =
                            prepare_replace(&quote_table, &row.columns, false, translate_to_insert)
                        {
                            statement_len = template.len();
                            match replace_cache.iter_mut().find(|(t, _)| *t == template) {
                                Some((_, rows)) => rows.push(args),
                                None => replace_cache.push((template, vec![args])),
                            }
                        }
                    } else if let Some((sql, args)) =
                        prepare_replace(&quote_table, &row.columns, true, translate_to_insert)
                    {
                        statement_len = sql.len();
                        sqls.push(sql);
                        values.push(args);
                    }
                }

                approximate_size +=
                    i64::try_from(statement_len).unwrap_or(i64::MAX) + row.approximate_size;
            }
        }
        flush_cached_replaces(&cfg, &mut replace_cache, &mut sqls, &mut values);

        (
            PreparedDmls {
                start_ts,
                sqls,
                values,
                row_count,
                approximate_size,
            },
            callbacks,
        )
    }

}

// ── Execution ───────────────────────────────────────────────────────

async fn exec_dml_with_retry(ctx: &ExecCtx, dmls: &PreparedDmls) -> Result<(), SinkError> {
    if dmls.sqls.len() != dmls.values.len() {
        return Err(SinkError::InvariantViolation(format!(
            "{} statements but {} value lists",
            dmls.sqls.len(),
            dmls.values.len()
        )));
    }
    if dmls.sqls.is_empty() {
        return Ok(());
    }

    let start = Instant::now();
    // Oversized batches skip the multi-statement attempt entirely; the
    // flag also latches on the first multi-statement failure and stays
    // set for the remaining retries of this flush.
    let mut fallback_to_seq = dmls.approximate_size * 2 > ctx.cfg.max_allowed_packet;

    let mut attempt = 0_usize;
    loop {
        attempt += 1;
        match exec_once(ctx, dmls, &mut fallback_to_seq).await {
            Ok(()) => {
                tracing::debug!(
                    changefeed = %ctx.changefeed,
                    worker_id = ctx.worker_id,
                    rows = dmls.row_count,
                    "Exec rows succeeded"
                );
                return Ok(());
            }
            Err(err) => {
                log_dml_txn_err(ctx, &err, start, dmls);
                if err.is_retryable() && attempt < ctx.cfg.dml_max_retry {
                    tokio::time::sleep(backoff_delay(
                        attempt,
                        ctx.cfg.backoff_base_delay,
                        ctx.cfg.backoff_max_delay,
                    ))
                    .await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

async fn exec_once(
    ctx: &ExecCtx,
    dmls: &PreparedDmls,
    fallback_to_seq: &mut bool,
) -> Result<(), SinkError> {
    let mut conn = ctx.pool.acquire().await.map_err(SinkError::from)?;
    conn.begin().await.map_err(SinkError::from)?;

    let write_timeout = ctx.cfg.write_timeout + NETWORK_DRIFT;
    let exec_result = if ctx.cfg.multi_stmt_enable && !*fallback_to_seq {
        let result = multi_stmt_execute(conn.as_mut(), dmls, write_timeout).await;
        if result.is_err() {
            *fallback_to_seq = true;
        }
        result
    } else {
        sequence_execute(conn.as_mut(), dmls, write_timeout).await
    };
    if let Err(err) = exec_result {
        rollback_quietly(ctx, conn.as_mut()).await;
        return Err(err);
    }

    if let Err(err) = set_write_source(ctx, conn.as_mut()).await {
        rollback_quietly(ctx, conn.as_mut()).await;
        return Err(err);
    }

    conn.commit().await.map_err(SinkError::from)
}

/// Mark the transaction's write source so downstream tooling can
/// distinguish replicated writes. Downstreams without the variable are
/// tolerated.
async fn set_write_source(ctx: &ExecCtx, conn: &mut dyn SinkConn) -> Result<(), SinkError> {
    if !ctx.cfg.write_source_available {
        return Ok(());
    }
    let sql = format!("SET SESSION tidb_cdc_write_source = {}", ctx.cfg.source_id);
    match conn.execute(&sql, &[]).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind == DbErrorKind::UnknownSystemVariable => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn rollback_quietly(ctx: &ExecCtx, conn: &mut dyn SinkConn) {
    if let Err(err) = conn.rollback().await {
        if err.kind == DbErrorKind::Cancelled {
            tracing::debug!(changefeed = %ctx.changefeed, error = %err, "Rollback cancelled");
        } else {
            tracing::warn!(changefeed = %ctx.changefeed, error = %err, "Failed to rollback txn");
        }
    }
}

fn log_dml_txn_err(ctx: &ExecCtx, err: &SinkError, start: Instant, dmls: &PreparedDmls) {
    let query = query_snippet(&dmls.sqls);
    if err.is_retryable() {
        tracing::warn!(
            changefeed = %ctx.changefeed,
            worker_id = ctx.worker_id,
            error = %err,
            elapsed = ?start.elapsed(),
            query = %query,
            count = dmls.row_count,
            start_ts = ?dmls.start_ts,
            "Execute DMLs with error, retry later"
        );
    } else {
        tracing::error!(
            changefeed = %ctx.changefeed,
            worker_id = ctx.worker_id,
            error = %err,
            elapsed = ?start.elapsed(),
            query = %query,
            count = dmls.row_count,
            "Execute DMLs with error, can not retry"
        );
    }
}

/// Convert byte values of textual columns to strings. Binary-charset
/// columns keep their bytes.
fn convert_binary_to_string(cols: &mut [Option<Column>]) {
    for col in cols.iter_mut().flatten() {
        if col.charset.is_empty() || col.charset == "binary" {
            continue;
        }
        if let SqlValue::Bytes(bytes) = &col.value {
            col.value = SqlValue::Text(String::from_utf8_lossy(bytes).into_owned());
        }
    }
}

/// Drain the replace cache into statements, preserving DML order.
fn flush_cached_replaces(
    cfg: &SinkConfig,
    cache: &mut ReplaceCache,
    sqls: &mut Vec<String>,
    values: &mut Vec<Vec<SqlValue>>,
) {
    if !cfg.batch_replace_enabled || cache.is_empty() {
        return;
    }
    let (mut replace_sqls, mut replace_values) = reduce_replace(cache, cfg.batch_replace_size);
    sqls.append(&mut replace_sqls);
    values.append(&mut replace_values);
    cache.clear();
}

/// Grouped batch statements for one transaction event.
fn batch_single_txn_dmls(
    cfg: &SinkConfig,
    rows: &[RowChange],
    translate_to_insert: bool,
    sqls: &mut Vec<String>,
    values: &mut Vec<Vec<SqlValue>>,
) {
    let table = rows[0].table.clone();
    let (insert_groups, update_groups, delete_groups) = group_rows_by_type(cfg, rows);

    for group in &delete_groups {
        let (sql, value) = gen_delete_sql(&table, group);
        sqls.push(sql);
        values.push(value);
    }

    for group in &update_groups {
        if cfg.is_tidb {
            // Multi-row UPDATE matches TiDB's evaluation; stock MySQL
            // evaluates assignments differently, so it gets per-row
            // statements.
            gen_update_sqls(cfg, &table, group, sqls, values);
        } else {
            for row in group {
                if let Some((sql, value)) = prepare_update(
                    &table.quote_string(),
                    &row.pre_columns,
                    &row.columns,
                    cfg.force_replicate,
                ) {
                    sqls.push(sql);
                    values.push(value);
                }
            }
        }
    }

    for group in &insert_groups {
        let kind = if translate_to_insert {
            InsertKind::Insert
        } else {
            InsertKind::Replace
        };
        let (sql, value) = gen_insert_sql(kind, &table, group);
        sqls.push(sql);
        values.push(value);
    }
}

/// Split an event's rows by change type, capping each group.
fn group_rows_by_type<'a>(
    cfg: &SinkConfig,
    rows: &'a [RowChange],
) -> (
    Vec<Vec<&'a RowChange>>,
    Vec<Vec<&'a RowChange>>,
    Vec<Vec<&'a RowChange>>,
) {
    let mut inserts: Vec<Vec<&RowChange>> = Vec::new();
    let mut updates: Vec<Vec<&RowChange>> = Vec::new();
    let mut deletes: Vec<Vec<&RowChange>> = Vec::new();
    let mut insert_group: Vec<&RowChange> = Vec::new();
    let mut update_group: Vec<&RowChange> = Vec::new();
    let mut delete_group: Vec<&RowChange> = Vec::new();

    for row in rows {
        if row.is_insert() {
            insert_group.push(row);
            if insert_group.len() >= cfg.max_txn_row {
                inserts.push(std::mem::take(&mut insert_group));
            }
        } else if row.is_delete() {
            delete_group.push(row);
            if delete_group.len() >= cfg.max_txn_row {
                deletes.push(std::mem::take(&mut delete_group));
            }
        } else if row.is_update() {
            update_group.push(row);
            if update_group.len() >= cfg.max_multi_update_row_count {
                updates.push(std::mem::take(&mut update_group));
            }
        }
    }
    if !insert_group.is_empty() {
        inserts.push(insert_group);
    }
    if !update_group.is_empty() {
        updates.push(update_group);
    }
    if !delete_group.is_empty() {
        deletes.push(delete_group);
    }
    (inserts, updates, deletes)
}

/// Multi-row UPDATE when the rows are small enough for one round-trip,
/// per-row otherwise.
fn gen_update_sqls(
    cfg: &SinkConfig,
    table: &sluice_model::TableRef,
    rows: &[&RowChange],
    sqls: &mut Vec<String>,
    values: &mut Vec<Vec<SqlValue>>,
) {
    let total_size: i64 = rows.iter().map(|r| r.approximate_size).sum();
    let count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
    let threshold = i64::try_from(cfg.max_multi_update_row_size).unwrap_or(i64::MAX);
    if total_size < threshold * count {
        let (sql, value) = gen_update_sql_fast(table, rows);
        sqls.push(sql);
        values.push(value);
        return;
    }
    for row in rows {
        if let Some((sql, value)) = prepare_update(
            &table.quote_string(),
            &row.pre_columns,
            &row.columns,
            cfg.force_replicate,
        ) {
            sqls.push(sql);
            values.push(value);
        }
    }
}

async fn multi_stmt_execute(
    conn: &mut dyn SinkConn,
    dmls: &PreparedDmls,
    write_timeout: Duration,
) -> Result<(), SinkError> {
    let joined = dmls.sqls.join(";");
    let args: Vec<SqlValue> = dmls.values.iter().flatten().cloned().collect();
    // The prepared-statement protocol takes exactly one statement per
    // prepare, so the joined batch must go over the text protocol with the
    // parameters interpolated client-side.
    let sql = interpolate_sql(&joined, &args).ok_or_else(|| {
        SinkError::InvariantViolation(format!(
            "{} arguments do not match the batch placeholders",
            args.len()
        ))
    })?;
    match tokio::time::timeout(write_timeout, conn.execute(&sql, &[])).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(SinkError::Timeout(write_timeout)),
    }
}

async fn sequence_execute(
    conn: &mut dyn SinkConn,
    dmls: &PreparedDmls,
    write_timeout: Duration,
) -> Result<(), SinkError> {
    for (sql, args) in dmls.sqls.iter().zip(&dmls.values) {
        match tokio::time::timeout(write_timeout, conn.execute(sql, args)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(SinkError::Timeout(write_timeout)),
        }
    }
    Ok(())
}

/// First kilobyte of the joined statements, for error messages.
///
/// Truncates on raw bytes like the wire does; a multibyte character
/// straddling the limit degrades to a replacement character instead of
/// splitting the string mid-character.
fn query_snippet(sqls: &[String]) -> String {
    let joined = sqls.join("; ");
    let end = joined.len().min(1024);
    String::from_utf8_lossy(&joined.as_bytes()[..end]).into_owned()
}

/// Exponential backoff capped at `max`.
fn backoff_delay(attempt: usize, base: Duration, max: Duration) -> Duration {
    let exp = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
    base.saturating_mul(2_u32.saturating_pow(exp)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::DbOpError;
    use crate::testing::ScriptedDb;
    use parking_lot::Mutex;
    use sluice_model::{TableRef, TxnEvent};

    fn key_col(id: i64) -> Option<Column> {
        Some(Column::handle("id", SqlValue::Int(id)))
    }

    fn name_col(name: &str) -> Option<Column> {
        Some(Column::new("name", SqlValue::Text(name.to_string())))
    }

    fn insert_row(table: &TableRef, id: i64, commit_ts: Ts, replicating_ts: Ts) -> RowChange {
        RowChange {
            table: table.clone(),
            pre_columns: vec![],
            columns: vec![key_col(id), name_col("n")],
            commit_ts,
            start_ts: commit_ts - 1,
            replicating_ts,
            approximate_size: 32,
            index_columns: vec![vec![0]],
        }
    }

    fn update_row(table: &TableRef, id: i64, commit_ts: Ts) -> RowChange {
        RowChange {
            table: table.clone(),
            pre_columns: vec![key_col(id), name_col("old")],
            columns: vec![key_col(id), name_col("new")],
            commit_ts,
            start_ts: commit_ts - 1,
            replicating_ts: 1,
            approximate_size: 32,
            index_columns: vec![vec![0]],
        }
    }

    fn delete_row(table: &TableRef, id: i64, commit_ts: Ts) -> RowChange {
        RowChange {
            table: table.clone(),
            pre_columns: vec![key_col(id), name_col("old")],
            columns: vec![],
            commit_ts,
            start_ts: commit_ts - 1,
            replicating_ts: 1,
            approximate_size: 32,
            index_columns: vec![vec![0]],
        }
    }

    fn event(rows: Vec<RowChange>) -> TxnCallbackableEvent {
        let start_ts = rows.first().map_or(0, |r| r.start_ts);
        let commit_ts = rows.first().map_or(0, |r| r.commit_ts);
        TxnCallbackableEvent {
            event: TxnEvent {
                rows,
                start_ts,
                commit_ts,
                wait_flush: false,
            },
            callback: None,
        }
    }

    fn backend(cfg: SinkConfig) -> (Arc<ScriptedDb>, MysqlBackend) {
        let db = ScriptedDb::new();
        let backend = MysqlBackend::new(0, "test-feed", cfg, db.pool());
        (db, backend)
    }

    #[test]
    fn test_on_txn_event_flush_thresholds() {
        let (_db, mut backend) = backend(SinkConfig {
            max_txn_row: 3,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");

        assert!(!backend.on_txn_event(event(vec![insert_row(&table, 1, 10, 1)])));
        assert!(!backend.on_txn_event(event(vec![insert_row(&table, 2, 11, 1)])));
        assert!(backend.on_txn_event(event(vec![insert_row(&table, 3, 12, 1)])));

        let mut waiting = event(vec![insert_row(&table, 4, 13, 1)]);
        waiting.event.wait_flush = true;
        assert!(backend.on_txn_event(waiting));
    }

    #[tokio::test]
    async fn test_batch_replace_coalescing() {
        let (db, mut backend) = backend(SinkConfig {
            batch_replace_enabled: true,
            batch_replace_size: 2,
            enable_old_value: false,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        for (i, ts) in [(1, 10), (2, 11), (3, 12)] {
            backend.on_txn_event(event(vec![insert_row(&table, i, ts, 1)]));
        }
        backend.flush().await.unwrap();

        let committed = db.committed();
        assert_eq!(committed.len(), 1);
        let stmts = &committed[0];
        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[0].sql,
            "REPLACE INTO `db`.`t` (`id`,`name`) VALUES (?,?),(?,?)"
        );
        assert_eq!(
            stmts[1].sql,
            "REPLACE INTO `db`.`t` (`id`,`name`) VALUES (?,?)"
        );
        assert_eq!(stmts[0].params.len(), 4);
        assert_eq!(stmts[1].params.len(), 2);
    }

    #[tokio::test]
    async fn test_translate_to_insert_rule() {
        // Old value on, safe mode off, commit after replication start:
        // plain INSERT.
        let (db1, mut backend1) = backend(SinkConfig {
            batch_replace_enabled: false,
            enable_old_value: true,
            safe_mode: false,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend1.on_txn_event(event(vec![insert_row(&table, 1, 100, 10)]));
        backend1.flush().await.unwrap();
        assert!(db1.committed()[0][0].sql.starts_with("INSERT INTO"));

        // A transaction that predates the replication start falls back to
        // REPLACE.
        let (db2, mut backend2) = backend(SinkConfig {
            batch_replace_enabled: false,
            enable_old_value: true,
            ..SinkConfig::default()
        });
        backend2.on_txn_event(event(vec![insert_row(&table, 1, 5, 10)]));
        backend2.flush().await.unwrap();
        assert!(db2.committed()[0][0].sql.starts_with("REPLACE INTO"));

        // Safe mode always replaces.
        let (db3, mut backend3) = backend(SinkConfig {
            batch_replace_enabled: false,
            enable_old_value: true,
            safe_mode: true,
            ..SinkConfig::default()
        });
        backend3.on_txn_event(event(vec![insert_row(&table, 1, 100, 10)]));
        backend3.flush().await.unwrap();
        assert!(db3.committed()[0][0].sql.starts_with("REPLACE INTO"));
    }

    #[tokio::test]
    async fn test_mixed_rows_keep_order() {
        let (db, mut backend) = backend(SinkConfig {
            batch_replace_enabled: true,
            batch_replace_size: 10,
            enable_old_value: true,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        backend.on_txn_event(event(vec![update_row(&table, 1, 101)]));
        backend.on_txn_event(event(vec![insert_row(&table, 2, 102, 1)]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        // The cached insert flushes before the update to preserve order.
        assert!(stmts[0].sql.starts_with("INSERT INTO"));
        assert!(stmts[1].sql.starts_with("UPDATE"));
        assert!(stmts[2].sql.starts_with("INSERT INTO"));
    }

    #[tokio::test]
    async fn test_batch_dml_groups_by_type() {
        let (db, mut backend) = backend(SinkConfig {
            batch_dml_enable: true,
            is_tidb: true,
            enable_old_value: true,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![
            delete_row(&table, 1, 100),
            update_row(&table, 2, 100),
            update_row(&table, 3, 100),
            insert_row(&table, 4, 100, 1),
            insert_row(&table, 5, 100, 1),
        ]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].sql.starts_with("DELETE FROM"));
        assert!(stmts[1].sql.contains("CASE WHEN"));
        assert!(stmts[2].sql.starts_with("INSERT INTO"));
    }

    #[tokio::test]
    async fn test_mysql_downstream_gets_per_row_updates() {
        let (db, mut backend) = backend(SinkConfig {
            batch_dml_enable: true,
            is_tidb: false,
            enable_old_value: true,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![
            update_row(&table, 1, 100),
            update_row(&table, 2, 100),
        ]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.ends_with("LIMIT 1"));
        assert!(stmts[1].sql.ends_with("LIMIT 1"));
    }

    #[tokio::test]
    async fn test_oversized_updates_fall_back_to_per_row() {
        let (db, mut backend) = backend(SinkConfig {
            batch_dml_enable: true,
            is_tidb: true,
            enable_old_value: true,
            max_multi_update_row_size: 16,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        let mut r1 = update_row(&table, 1, 100);
        let mut r2 = update_row(&table, 2, 100);
        r1.approximate_size = 1000;
        r2.approximate_size = 1000;
        backend.on_txn_event(event(vec![r1, r2]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.ends_with("LIMIT 1"));
    }

    #[tokio::test]
    async fn test_retry_then_success_and_nonretryable() {
        let (db, mut backend) = backend(SinkConfig {
            backoff_base_delay: Duration::from_millis(1),
            backoff_max_delay: Duration::from_millis(2),
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");

        let fired = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&fired);
        let mut ev = event(vec![insert_row(&table, 1, 100, 1)]);
        ev.callback = Some(Box::new(move || record.lock().push("first")));
        backend.on_txn_event(ev);

        // A transient failure retries and then succeeds.
        db.fail_next_execute(DbOpError::transient("connection reset"));
        backend.flush().await.unwrap();
        assert_eq!(fired.lock().as_slice(), &["first"]);
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.committed().len(), 1);

        // A duplicate-entry failure surfaces immediately and fires no
        // callbacks.
        let record = Arc::clone(&fired);
        let mut ev = event(vec![insert_row(&table, 2, 101, 1)]);
        ev.callback = Some(Box::new(move || record.lock().push("second")));
        backend.on_txn_event(ev);
        db.fail_next_execute(DbOpError::new(
            DbErrorKind::DuplicateEntry,
            "Duplicate entry '2' for key 'PRIMARY'",
        ));
        let err = backend.flush().await.unwrap_err();
        assert!(matches!(err, SinkError::DuplicateEntry(_)));
        assert_eq!(fired.lock().as_slice(), &["first"]);
        assert_eq!(db.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_multi_stmt_concatenates_statements() {
        let (db, mut backend) = backend(SinkConfig {
            multi_stmt_enable: true,
            batch_replace_enabled: false,
            enable_old_value: false,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        backend.on_txn_event(event(vec![insert_row(&table, 2, 101, 1)]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].sql.contains(';'));
        // The batch travels over the text protocol: the values are
        // interpolated client-side and no parameters remain.
        assert!(stmts[0].params.is_empty());
        assert!(stmts[0].sql.contains("VALUES (1,'n')"));
        assert!(stmts[0].sql.contains("VALUES (2,'n')"));
    }

    #[tokio::test]
    async fn test_oversized_batch_executes_sequentially() {
        let (db, mut backend) = backend(SinkConfig {
            multi_stmt_enable: true,
            batch_replace_enabled: false,
            enable_old_value: false,
            max_allowed_packet: 16,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        backend.on_txn_event(event(vec![insert_row(&table, 2, 101, 1)]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(stmts.len(), 2);
        assert!(!stmts[0].sql.contains(';'));
    }

    #[tokio::test]
    async fn test_multi_stmt_failure_falls_back_within_flush() {
        let (db, mut backend) = backend(SinkConfig {
            multi_stmt_enable: true,
            batch_replace_enabled: false,
            enable_old_value: false,
            backoff_base_delay: Duration::from_millis(1),
            backoff_max_delay: Duration::from_millis(2),
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        backend.on_txn_event(event(vec![insert_row(&table, 2, 101, 1)]));

        db.fail_next_execute(DbOpError::transient("multi statement rejected"));
        backend.flush().await.unwrap();

        // First attempt was the concatenated statement; the retry ran the
        // statements one by one.
        let committed = db.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].len(), 2);
        let executed = db.executed();
        assert!(executed[0].sql.contains(';'));
        assert!(!executed[1].sql.contains(';'));
    }

    #[tokio::test]
    async fn test_write_source_marking() {
        let (db, mut backend) = backend(SinkConfig {
            write_source_available: true,
            source_id: 7,
            batch_replace_enabled: false,
            enable_old_value: false,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        backend.flush().await.unwrap();

        let stmts = &db.committed()[0];
        assert_eq!(
            stmts.last().unwrap().sql,
            "SET SESSION tidb_cdc_write_source = 7"
        );
    }

    #[tokio::test]
    async fn test_unknown_write_source_variable_is_tolerated() {
        let (db, mut backend) = backend(SinkConfig {
            write_source_available: true,
            batch_replace_enabled: false,
            enable_old_value: false,
            ..SinkConfig::default()
        });
        let table = TableRef::new("db", "t");
        backend.on_txn_event(event(vec![insert_row(&table, 1, 100, 1)]));
        // The insert succeeds; the SET SESSION probe hits an old server.
        db.pass_next_execute();
        db.fail_next_execute(DbOpError::new(
            DbErrorKind::UnknownSystemVariable,
            "Unknown system variable 'tidb_cdc_write_source'",
        ));
        backend.flush().await.unwrap();
        assert_eq!(db.committed().len(), 1);
    }

    #[test]
    fn test_binary_to_string_conversion() {
        let mut cols = vec![
            Some(Column {
                name: "utf8_col".to_string(),
                value: SqlValue::Bytes(b"hello".to_vec()),
                charset: "utf8mb4".to_string(),
                flags: Default::default(),
            }),
            Some(Column {
                name: "bin_col".to_string(),
                value: SqlValue::Bytes(b"\x00\x01".to_vec()),
                charset: "binary".to_string(),
                flags: Default::default(),
            }),
        ];
        convert_binary_to_string(&mut cols);
        assert_eq!(
            cols[0].as_ref().unwrap().value,
            SqlValue::Text("hello".to_string())
        );
        assert!(matches!(
            cols[1].as_ref().unwrap().value,
            SqlValue::Bytes(_)
        ));
    }

    #[test]
    fn test_query_snippet_survives_multibyte_at_the_limit() {
        // A multibyte identifier straddling the kilobyte limit: the first
        // byte of `订` sits at offset 1023, so the cut lands inside the
        // character.
        let mut sql = "X".repeat(1023);
        sql.push_str("订单表");
        let snippet = query_snippet(&[sql]);
        assert!(snippet.as_bytes().len() <= 1024 + 3);
        assert!(snippet.starts_with("XXX"));
        assert!(snippet.ends_with('\u{FFFD}'));

        let short = query_snippet(&["SELECT 1".to_string(), "SELECT 2".to_string()]);
        assert_eq!(short, "SELECT 1; SELECT 2");
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(1, base, max), base);
        assert_eq!(backoff_delay(2, base, max), base * 2);
        assert_eq!(backoff_delay(20, base, max), max);
    }
}
