//! DDL job puller.
//!
//! Tails the system DDL job queue, decodes each PUT into a [`DdlJob`],
//! filters jobs against the stream's table rules, applies kept jobs to the
//! schema store, and advances a monotonic schema-resolved timestamp.
//!
//! All mutation funnels through a single consumer task over the sorted raw
//! channel; only the resolved timestamp is shared, behind an atomic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sluice_model::{DdlJob, DdlJobType, OpType, RawKvEntry, RenameTablesArgs, TableInfo, Ts};
use sluice_schema::SchemaStorage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{MetaResolver, SystemTableMeta};
use crate::filter::TableFilter;
use crate::PullerError;

/// Warn when the resolved ts has not advanced for this long.
const STUCK_WARN_DURATION: Duration = Duration::from_secs(30);

/// Capacity of the decoded-job output channel.
const OUTPUT_CHANNEL_CAPACITY: usize = 128;

/// Key prefix of legacy-format DDL jobs, stored in the meta keyspace.
const META_KEY_PREFIX: u8 = b'm';

/// A decoded entry leaving the job puller: either a kept DDL job or a
/// resolved marker.
#[derive(Debug)]
pub struct DdlEntry {
    /// The decoded job; `None` for resolved markers.
    pub job: Option<DdlJob>,
    /// Entry kind.
    pub op_type: OpType,
    /// Commit timestamp, or the watermark for resolved markers.
    pub commit_ts: Ts,
}

/// Decodes, filters, and applies DDL jobs from the sorted raw stream.
pub struct DdlJobPuller {
    changefeed: String,
    schema_storage: Arc<SchemaStorage>,
    filter: Arc<dyn TableFilter>,
    meta_resolver: Arc<dyn MetaResolver>,
    /// Lazily resolved when the first row-format job arrives.
    system_meta: Option<SystemTableMeta>,
    resolved_ts: Arc<AtomicU64>,
    output: mpsc::Sender<DdlEntry>,
}

impl DdlJobPuller {
    /// Create a job puller and its output channel.
    #[must_use]
    pub fn new(
        changefeed: impl Into<String>,
        schema_storage: Arc<SchemaStorage>,
        filter: Arc<dyn TableFilter>,
        meta_resolver: Arc<dyn MetaResolver>,
    ) -> (Self, mpsc::Receiver<DdlEntry>) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        (
            Self {
                changefeed: changefeed.into(),
                schema_storage,
                filter,
                meta_resolver,
                system_meta: None,
                resolved_ts: Arc::new(AtomicU64::new(0)),
                output: tx,
            },
            rx,
        )
    }

    /// The puller's resolved timestamp handle.
    #[must_use]
    pub fn resolved_ts_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.resolved_ts)
    }

    /// Consume the sorted raw stream until it closes or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: decode failures, schema conflicts,
    /// rename-safety and eligibility violations.
    pub async fn run(
        mut self,
        mut sorted_rx: mpsc::Receiver<RawKvEntry>,
        cancel: CancellationToken,
    ) -> Result<(), PullerError> {
        loop {
            let raw = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PullerError::Cancelled),
                raw = sorted_rx.recv() => match raw {
                    Some(raw) => raw,
                    None => return Ok(()),
                },
            };
            if let Some(entry) = self.handle_raw_entry(raw)? {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(PullerError::Cancelled),
                    sent = self.output.send(entry) => {
                        if sent.is_err() {
                            return Err(PullerError::ChannelClosed);
                        }
                    }
                }
            }
        }
    }

    /// Handle one sorted raw entry; returns the entry to emit downstream,
    /// if any.
    pub fn handle_raw_entry(
        &mut self,
        raw: RawKvEntry,
    ) -> Result<Option<DdlEntry>, PullerError> {
        if raw.op_type == OpType::Resolved {
            self.schema_storage.advance_resolved_ts(raw.commit_ts);
            self.resolved_ts.fetch_max(raw.commit_ts, Ordering::AcqRel);
            return Ok(Some(DdlEntry {
                job: None,
                op_type: OpType::Resolved,
                commit_ts: raw.commit_ts,
            }));
        }

        let Some(mut job) = self.decode_job(&raw)? else {
            return Ok(None);
        };
        let skip = self.handle_job(&mut job)?;
        tracing::info!(
            changefeed = %self.changefeed,
            query = %job.query,
            job_id = job.id,
            skip,
            "Handle DDL job"
        );
        if skip {
            return Ok(None);
        }
        Ok(Some(DdlEntry {
            op_type: raw.op_type,
            commit_ts: raw.commit_ts,
            job: Some(job),
        }))
    }

    fn resolved(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    /// Decode a PUT into a job. Legacy-format jobs (meta keyspace) decode
    /// directly; row-format jobs need the lazily resolved `job_meta`
    /// column id.
    fn decode_job(&mut self, raw: &RawKvEntry) -> Result<Option<DdlJob>, PullerError> {
        if raw.op_type != OpType::Put {
            return Ok(None);
        }
        let legacy = raw.key.first() == Some(&META_KEY_PREFIX);
        if !legacy && self.system_meta.is_none() {
            self.system_meta = Some(self.meta_resolver.system_table_meta()?);
        }

        let decode_err = |reason: String| PullerError::DecodeJob {
            key: raw.key.clone(),
            reason,
        };

        if legacy {
            let job: DdlJob =
                serde_json::from_slice(&raw.value).map_err(|e| decode_err(e.to_string()))?;
            return Ok(Some(job));
        }

        // Row format: the value is a column-id → value map; the job lives
        // in the job_meta column as embedded JSON.
        let meta = self.system_meta.as_ref().ok_or_else(|| {
            PullerError::MetaNotFound("system table meta unresolved".to_string())
        })?;
        let row: serde_json::Value =
            serde_json::from_slice(&raw.value).map_err(|e| decode_err(e.to_string()))?;
        let cell = row
            .get(meta.job_meta_column_id.to_string())
            .ok_or_else(|| decode_err("job_meta column missing".to_string()))?;
        let job: DdlJob = match cell {
            serde_json::Value::String(inner) => {
                serde_json::from_str(inner).map_err(|e| decode_err(e.to_string()))?
            }
            other => {
                serde_json::from_value(other.clone()).map_err(|e| decode_err(e.to_string()))?
            }
        };
        Ok(Some(job))
    }

    /// Filter and apply one job. Returns `true` when the job is skipped.
    fn handle_job(&self, job: &mut DdlJob) -> Result<bool, PullerError> {
        if job.binlog_info.finished_ts <= self.resolved() || job.binlog_info.schema_version == 0 {
            // schema_version == 0 means the job was ignored upstream.
            tracing::info!(
                changefeed = %self.changefeed,
                job_finished_ts = job.binlog_info.finished_ts,
                resolved_ts = self.resolved(),
                query = %job.query,
                "DDL job finished ts not above resolved ts, discard"
            );
            return Ok(true);
        }

        let snap_before = self.schema_storage.last_snapshot();
        if let Err(e) = snap_before.fill_schema_name(job) {
            tracing::info!(error = %e, query = %job.query, "Failed to fill schema name for DDL job");
            if self
                .filter
                .should_discard_ddl(job.job_type, &job.schema_name, &job.table_name)
            {
                return Ok(true);
            }
            return Err(e.into());
        }

        let skip = match job.job_type {
            DdlJobType::RenameTables => self.handle_rename_tables(job)?,
            DdlJobType::RenameTable => {
                let new_name = job
                    .binlog_info
                    .table_info
                    .as_ref()
                    .map(|info| info.name.clone())
                    .unwrap_or_default();
                match snap_before.physical_table_by_id(job.table_id) {
                    None => {
                        // The old identity was never tracked; if the new
                        // name is replicated the source rows are missing.
                        let discard = self.filter.should_discard_ddl(
                            job.job_type,
                            &job.schema_name,
                            &new_name,
                        );
                        if !discard {
                            return Err(PullerError::SyncRenameTable {
                                table_id: job.table_id,
                                query: job.query.clone(),
                            });
                        }
                        true
                    }
                    Some(old_table) => {
                        let old_schema = snap_before
                            .schema_by_id(old_table.schema_id)
                            .map(|s| s.name.clone())
                            .unwrap_or_default();
                        let skip_old = self.filter.should_discard_ddl(
                            job.job_type,
                            &old_schema,
                            &old_table.name,
                        );
                        let skip_new = self.filter.should_discard_ddl(
                            job.job_type,
                            &job.schema_name,
                            &new_name,
                        );
                        if skip_old && !skip_new {
                            return Err(PullerError::SyncRenameTable {
                                table_id: job.table_id,
                                query: job.query.clone(),
                            });
                        }
                        skip_old && skip_new
                    }
                }
            }
            _ => {
                if let Some(info) = &job.binlog_info.table_info {
                    job.table_name.clone_from(&info.name);
                }
                self.filter
                    .should_discard_ddl(job.job_type, &job.schema_name, &job.table_name)
            }
        };

        if skip {
            tracing::info!(
                changefeed = %self.changefeed,
                schema = %job.schema_name,
                table = %job.table_name,
                query = %job.query,
                "DDL job schema or table does not match, discard it"
            );
            return Ok(true);
        }

        self.schema_storage.handle_ddl_job(job)?;
        self.resolved_ts
            .fetch_max(job.binlog_info.finished_ts, Ordering::AcqRel);

        self.check_ineligible_table_ddl(&snap_before, job)
    }

    /// Per-child filtering of a multi-table rename; retained children are
    /// repacked into the job's parallel argument arrays.
    fn handle_rename_tables(&self, job: &mut DdlJob) -> Result<bool, PullerError> {
        let args = RenameTablesArgs::decode(job)?;
        if args.len() != job.binlog_info.multi_table_infos.len() {
            return Err(sluice_model::ModelError::InvalidDdlJob {
                job_id: job.id,
                reason: "rename children disagree with table infos".to_string(),
            }
            .into());
        }

        let snap = self.schema_storage.last_snapshot();
        let mut remain = RenameTablesArgs::default();
        let mut remain_tables: Vec<TableInfo> = Vec::new();

        for (i, table_info) in job.binlog_info.multi_table_infos.iter().enumerate() {
            let discard_old = match snap.physical_table_by_id(table_info.id) {
                None => true,
                Some(old_table) => self.filter.should_discard_ddl(
                    job.job_type,
                    &args.old_schema_names[i],
                    &old_table.name,
                ),
            };
            let discard_new = match snap.schema_by_id(args.new_schema_ids[i]) {
                None => true,
                Some(schema) => self.filter.should_discard_ddl(
                    job.job_type,
                    &schema.name,
                    &args.new_table_names[i],
                ),
            };

            if discard_old && discard_new {
                tracing::info!(
                    table_id = table_info.id,
                    schema = %args.old_schema_names[i],
                    query = %job.query,
                    "Rename table is filtered"
                );
                continue;
            }
            if discard_old && !discard_new {
                return Err(PullerError::SyncRenameTable {
                    table_id: table_info.id,
                    query: job.query.clone(),
                });
            }
            remain.old_schema_ids.push(args.old_schema_ids[i]);
            remain.new_schema_ids.push(args.new_schema_ids[i]);
            remain.new_table_names.push(args.new_table_names[i].clone());
            remain.old_table_ids.push(args.old_table_ids[i]);
            remain
                .old_schema_names
                .push(args.old_schema_names[i].clone());
            remain_tables.push(table_info.clone());
        }

        if remain_tables.is_empty() {
            return Ok(true);
        }
        job.raw_args = remain.encode()?;
        job.binlog_info.multi_table_infos = remain_tables;
        Ok(false)
    }

    /// Eligibility transition check after a table DDL was applied.
    ///
    /// An eligible table turning ineligible is a data-loss hazard and
    /// fails the stream; a table that was already ineligible, or did not
    /// exist before, is skipped silently.
    fn check_ineligible_table_ddl(
        &self,
        snap_before: &sluice_schema::SchemaSnapshot,
        job: &DdlJob,
    ) -> Result<bool, PullerError> {
        if job.job_type.is_schema_ddl() {
            return Ok(false);
        }
        // Batch create applies unconditionally.
        if job.job_type == DdlJobType::CreateTables {
            return Ok(false);
        }
        let Some(table_info) = &job.binlog_info.table_info else {
            return Ok(false);
        };

        let snap_after = self.schema_storage.last_snapshot();

        if job.job_type == DdlJobType::CreateTable
            && !snap_after.is_ineligible_table_id(table_info.id)
        {
            return Ok(false);
        }

        if !snap_after.is_ineligible_table_id(table_info.id) {
            return Ok(false);
        }

        // Ineligible after the DDL; what was it before?
        let old_table_id = job.table_id;
        if snap_before.physical_table_by_id(old_table_id).is_none() {
            return Ok(true);
        }
        if snap_before.is_ineligible_table_id(old_table_id) {
            tracing::warn!(
                changefeed = %self.changefeed,
                query = %job.query,
                "Ignore the DDL event of ineligible table"
            );
            return Ok(true);
        }
        Err(PullerError::EligibleBecameIneligible {
            query: job.query.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct PendingJobs {
    queue: VecDeque<DdlJob>,
    last_job_id: i64,
}

/// Owner-side DDL puller: buffers kept jobs, tracks the resolved
/// timestamp, and warns when the stream stalls.
pub struct DdlPuller {
    changefeed: String,
    resolved_ts: AtomicU64,
    pending: Mutex<PendingJobs>,
    last_advanced: Mutex<Instant>,
}

impl DdlPuller {
    /// Create a puller starting from `start_ts`.
    #[must_use]
    pub fn new(changefeed: impl Into<String>, start_ts: Ts) -> Self {
        Self {
            changefeed: changefeed.into(),
            resolved_ts: AtomicU64::new(start_ts),
            pending: Mutex::new(PendingJobs::default()),
            last_advanced: Mutex::new(Instant::now()),
        }
    }

    /// Consume decoded entries until the channel closes or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`PullerError::Cancelled`] on cancellation.
    pub async fn run(
        &self,
        mut entries: mpsc::Receiver<DdlEntry>,
        cancel: CancellationToken,
    ) -> Result<(), PullerError> {
        tracing::info!(
            changefeed = %self.changefeed,
            resolved_ts = self.resolved_ts.load(Ordering::Acquire),
            "DDL puller started"
        );
        let mut ticker = tokio::time::interval(STUCK_WARN_DURATION);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(changefeed = %self.changefeed, "DDL puller stopped");
                    return Err(PullerError::Cancelled);
                }
                _ = ticker.tick() => {
                    let idle = self.last_advanced.lock().elapsed();
                    if idle > STUCK_WARN_DURATION {
                        tracing::warn!(
                            changefeed = %self.changefeed,
                            idle_secs = idle.as_secs(),
                            resolved_ts = self.resolved_ts.load(Ordering::Acquire),
                            "DDL puller resolved ts has not advanced"
                        );
                    }
                }
                entry = entries.recv() => {
                    let Some(entry) = entry else {
                        tracing::info!(changefeed = %self.changefeed, "DDL puller stopped");
                        return Ok(());
                    };
                    self.handle_entry(entry);
                }
            }
        }
    }

    /// Buffer one decoded entry.
    pub fn handle_entry(&self, entry: DdlEntry) {
        if entry.op_type == OpType::Resolved {
            let prev = self.resolved_ts.fetch_max(entry.commit_ts, Ordering::AcqRel);
            if entry.commit_ts > prev {
                *self.last_advanced.lock() = Instant::now();
            }
            return;
        }
        let Some(job) = entry.job else { return };
        let mut pending = self.pending.lock();
        if job.id == pending.last_job_id {
            // The KV stream may repeat a job; keep the first.
            tracing::warn!(
                changefeed = %self.changefeed,
                job_id = job.id,
                query = %job.query,
                "Ignore duplicated DDL job"
            );
            return;
        }
        tracing::info!(
            changefeed = %self.changefeed,
            job_id = job.id,
            query = %job.query,
            "Receive new DDL job"
        );
        pending.last_job_id = job.id;
        pending.queue.push_back(job);
    }

    /// Pop the first pending job, or report the resolved ts when none is
    /// pending.
    pub fn pop_front_ddl(&self) -> (Ts, Option<DdlJob>) {
        let mut pending = self.pending.lock();
        match pending.queue.pop_front() {
            Some(job) => (job.binlog_info.finished_ts, Some(job)),
            None => (self.resolved_ts.load(Ordering::Acquire), None),
        }
    }

    /// The effective resolved ts: the first pending job's finished ts, or
    /// the stream watermark when nothing is pending.
    pub fn resolved_ts(&self) -> Ts {
        let pending = self.pending.lock();
        pending
            .queue
            .front()
            .map_or_else(|| self.resolved_ts.load(Ordering::Acquire), |job| {
                job.binlog_info.finished_ts
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RuleFilter;
    use crate::testing::FixedMetaResolver;
    use bytes::Bytes;
    use sluice_model::{BinlogInfo, ColumnMeta, IndexMeta};

    fn table_info(id: i64, schema_id: i64, name: &str, unique_key: bool) -> TableInfo {
        let indexes = if unique_key {
            vec![IndexMeta {
                id: 1,
                name: "uk".to_string(),
                column_offsets: vec![0],
                unique: true,
                primary: false,
            }]
        } else {
            vec![]
        };
        TableInfo {
            id,
            schema_id,
            name: name.to_string(),
            columns: vec![ColumnMeta {
                id: 0,
                name: "a".to_string(),
                offset: 0,
                not_null: true,
                ..ColumnMeta::default()
            }],
            indexes,
            ..TableInfo::default()
        }
    }

    fn puller_with(
        rules: &[&str],
        setup: impl FnOnce(&SchemaStorage),
    ) -> (DdlJobPuller, mpsc::Receiver<DdlEntry>) {
        let storage = Arc::new(SchemaStorage::default());
        setup(&storage);
        DdlJobPuller::new(
            "test-feed",
            storage,
            Arc::new(RuleFilter::new(rules)),
            Arc::new(FixedMetaResolver::default()),
        )
    }

    fn seed_schema(storage: &SchemaStorage, schema_id: i64, name: &str, version: i64) {
        storage
            .handle_ddl_job(&DdlJob {
                id: version,
                job_type: DdlJobType::CreateSchema,
                schema_id,
                schema_name: name.to_string(),
                binlog_info: BinlogInfo {
                    finished_ts: version as Ts,
                    schema_version: version,
                    ..BinlogInfo::default()
                },
                ..DdlJob::default()
            })
            .unwrap();
    }

    fn seed_table(storage: &SchemaStorage, schema_id: i64, info: TableInfo, version: i64) {
        storage
            .handle_ddl_job(&DdlJob {
                id: version,
                job_type: DdlJobType::CreateTable,
                schema_id,
                table_id: info.id,
                table_name: info.name.clone(),
                binlog_info: BinlogInfo {
                    finished_ts: version as Ts,
                    schema_version: version,
                    table_info: Some(info),
                    multi_table_infos: vec![],
                },
                ..DdlJob::default()
            })
            .unwrap();
    }

    fn alter_job(id: i64, schema_id: i64, table_id: i64, info: TableInfo, ts: Ts) -> DdlJob {
        DdlJob {
            id,
            job_type: DdlJobType::DropIndex,
            schema_id,
            table_id,
            query: "ALTER TABLE t DROP INDEX uk".to_string(),
            binlog_info: BinlogInfo {
                finished_ts: ts,
                schema_version: ts as i64,
                table_info: Some(info),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        }
    }

    #[test]
    fn test_resolved_marker_advances_storage_and_puller() {
        let (mut puller, _rx) = puller_with(&["*.*"], |_| {});
        let entry = puller
            .handle_raw_entry(RawKvEntry::resolved(100))
            .unwrap()
            .unwrap();
        assert_eq!(entry.op_type, OpType::Resolved);
        assert_eq!(entry.commit_ts, 100);
        assert_eq!(puller.resolved(), 100);
        assert_eq!(puller.schema_storage.resolved_ts(), 100);

        // Regressions are ignored.
        let _ = puller.handle_raw_entry(RawKvEntry::resolved(50)).unwrap();
        assert_eq!(puller.resolved(), 100);
    }

    #[test]
    fn test_job_at_or_below_resolved_is_skipped() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
        });
        let _ = puller.handle_raw_entry(RawKvEntry::resolved(100)).unwrap();

        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::CreateTable,
            schema_id: 1,
            table_id: 10,
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(table_info(10, 1, "t", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        assert!(puller.handle_job(&mut job).unwrap());

        // schema_version == 0 means upstream ignored it.
        job.binlog_info.finished_ts = 200;
        job.binlog_info.schema_version = 0;
        assert!(puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_filtered_table_job_is_skipped() {
        let (mut puller, _rx) = puller_with(&["app.orders"], |storage| {
            seed_schema(storage, 1, "app", 1);
        });
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::CreateTable,
            schema_id: 1,
            table_id: 10,
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(table_info(10, 1, "users", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        assert!(puller.handle_job(&mut job).unwrap());
        // Name was filled from ids before filtering.
        assert_eq!(job.schema_name, "app");
        assert_eq!(job.table_name, "users");
    }

    #[test]
    fn test_kept_job_applies_and_advances_resolved() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
        });
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::CreateTable,
            schema_id: 1,
            table_id: 10,
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(table_info(10, 1, "orders", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        assert!(!puller.handle_job(&mut job).unwrap());
        assert_eq!(puller.resolved(), 100);
        assert!(puller
            .schema_storage
            .last_snapshot()
            .physical_table_by_id(10)
            .is_some());
    }

    #[test]
    fn test_eligible_became_ineligible_fails() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(10, 1, "orders", true), 2);
        });
        let mut job = alter_job(9, 1, 10, table_info(10, 1, "orders", false), 100);
        let err = puller.handle_job(&mut job).unwrap_err();
        assert!(matches!(err, PullerError::EligibleBecameIneligible { .. }));
    }

    #[test]
    fn test_ineligible_before_and_after_is_skipped() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(10, 1, "orders", false), 2);
        });
        let mut job = alter_job(9, 1, 10, table_info(10, 1, "orders", false), 100);
        assert!(puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_create_ineligible_table_is_skipped() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
        });
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::CreateTable,
            schema_id: 1,
            table_id: 10,
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(table_info(10, 1, "orders", false)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        // The table did not exist before, so the job is silently skipped.
        assert!(puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_create_tables_bypasses_ineligibility_check() {
        let (mut puller, _rx) = puller_with(&["*.*"], |storage| {
            seed_schema(storage, 1, "app", 1);
        });
        let infos = vec![
            table_info(10, 1, "a", true),
            table_info(11, 1, "b", false),
        ];
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::CreateTables,
            schema_id: 1,
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(infos[0].clone()),
                multi_table_infos: infos,
            },
            ..DdlJob::default()
        };
        assert!(!puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_rename_table_rules() {
        // Filter keeps only app.kept*; app.other is filtered out.
        let (mut puller, _rx) = puller_with(&["app.kept*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(10, 1, "kept_src", true), 2);
            seed_table(storage, 1, table_info(11, 1, "other", true), 3);
        });

        // Old name kept: the rename is replicated.
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::RenameTable,
            schema_id: 1,
            table_id: 10,
            query: "RENAME TABLE kept_src TO kept_dst".to_string(),
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: Some(table_info(10, 1, "kept_dst", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        assert!(!puller.handle_job(&mut job).unwrap());

        // Old filtered, new kept: unsafe, the source rows were never
        // replicated.
        let mut job = DdlJob {
            id: 10,
            job_type: DdlJobType::RenameTable,
            schema_id: 1,
            table_id: 11,
            query: "RENAME TABLE other TO kept_new".to_string(),
            binlog_info: BinlogInfo {
                finished_ts: 200,
                schema_version: 6,
                table_info: Some(table_info(11, 1, "kept_new", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        let err = puller.handle_job(&mut job).unwrap_err();
        assert!(matches!(
            err,
            PullerError::SyncRenameTable { table_id: 11, .. }
        ));

        // Old filtered, new filtered: skipped.
        let (mut puller, _rx) = puller_with(&["app.kept*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(11, 1, "other", true), 2);
        });
        let mut job = DdlJob {
            id: 11,
            job_type: DdlJobType::RenameTable,
            schema_id: 1,
            table_id: 11,
            query: "RENAME TABLE other TO other2".to_string(),
            binlog_info: BinlogInfo {
                finished_ts: 300,
                schema_version: 7,
                table_info: Some(table_info(11, 1, "other2", true)),
                multi_table_infos: vec![],
            },
            ..DdlJob::default()
        };
        assert!(puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_rename_tables_partial_filter_repacks_arrays() {
        // Three children; the filter keeps children 1 and 3.
        let (mut puller, _rx) = puller_with(&["app.kept*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(10, 1, "kept_a", true), 2);
            seed_table(storage, 1, table_info(11, 1, "other", true), 3);
            seed_table(storage, 1, table_info(12, 1, "kept_b", true), 4);
        });

        let args = RenameTablesArgs {
            old_schema_ids: vec![1, 1, 1],
            new_schema_ids: vec![1, 1, 1],
            new_table_names: vec![
                "kept_a2".to_string(),
                "other2".to_string(),
                "kept_b2".to_string(),
            ],
            old_table_ids: vec![10, 11, 12],
            old_schema_names: vec!["app".to_string(); 3],
        };
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::RenameTables,
            schema_id: 1,
            query: "RENAME TABLE ...".to_string(),
            raw_args: args.encode().unwrap(),
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: None,
                multi_table_infos: vec![
                    table_info(10, 1, "kept_a", true),
                    table_info(11, 1, "other", true),
                    table_info(12, 1, "kept_b", true),
                ],
            },
            ..DdlJob::default()
        };

        assert!(!puller.handle_job(&mut job).unwrap());
        assert_eq!(job.binlog_info.multi_table_infos.len(), 2);
        assert_eq!(job.binlog_info.multi_table_infos[0].id, 10);
        assert_eq!(job.binlog_info.multi_table_infos[1].id, 12);

        let repacked = RenameTablesArgs::decode(&job).unwrap();
        assert_eq!(repacked.old_table_ids, vec![10, 12]);
        assert_eq!(repacked.new_schema_ids, vec![1, 1]);
        assert_eq!(
            repacked.new_table_names,
            vec!["kept_a2".to_string(), "kept_b2".to_string()]
        );
        assert_eq!(repacked.old_schema_names, vec!["app".to_string(); 2]);
        assert_eq!(repacked.old_schema_ids, vec![1, 1]);
    }

    #[test]
    fn test_rename_tables_all_filtered_skips_job() {
        let (mut puller, _rx) = puller_with(&["app.kept*"], |storage| {
            seed_schema(storage, 1, "app", 1);
            seed_table(storage, 1, table_info(11, 1, "other", true), 2);
        });
        let args = RenameTablesArgs {
            old_schema_ids: vec![1],
            new_schema_ids: vec![1],
            new_table_names: vec!["other2".to_string()],
            old_table_ids: vec![11],
            old_schema_names: vec!["app".to_string()],
        };
        let mut job = DdlJob {
            id: 9,
            job_type: DdlJobType::RenameTables,
            schema_id: 1,
            raw_args: args.encode().unwrap(),
            binlog_info: BinlogInfo {
                finished_ts: 100,
                schema_version: 5,
                table_info: None,
                multi_table_infos: vec![table_info(11, 1, "other", true)],
            },
            ..DdlJob::default()
        };
        assert!(puller.handle_job(&mut job).unwrap());
    }

    #[test]
    fn test_decode_legacy_and_row_format() {
        let (mut puller, _rx) = puller_with(&["*.*"], |_| {});

        let job = DdlJob {
            id: 5,
            query: "CREATE TABLE t (a INT)".to_string(),
            ..DdlJob::default()
        };
        let legacy = RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from_static(b"mDDLJobHistory"),
            value: Bytes::from(serde_json::to_vec(&job).unwrap()),
            old_value: Bytes::new(),
            start_ts: 1,
            commit_ts: 2,
        };
        let decoded = puller.decode_job(&legacy).unwrap().unwrap();
        assert_eq!(decoded.id, 5);
        // Legacy decoding does not touch the system-table metadata.
        assert!(puller.system_meta.is_none());

        let row_value = serde_json::json!({
            "2": serde_json::to_string(&job).unwrap(),
        });
        let row = RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from_static(b"t\x00row"),
            value: Bytes::from(serde_json::to_vec(&row_value).unwrap()),
            old_value: Bytes::new(),
            start_ts: 1,
            commit_ts: 2,
        };
        let decoded = puller.decode_job(&row).unwrap().unwrap();
        assert_eq!(decoded.id, 5);
        // The first row-format entry resolved the metadata lazily.
        assert!(puller.system_meta.is_some());
    }

    #[test]
    fn test_duplicate_job_ids_collapse() {
        let puller = DdlPuller::new("test-feed", 0);
        let job = DdlJob {
            id: 7,
            binlog_info: BinlogInfo {
                finished_ts: 50,
                schema_version: 1,
                ..BinlogInfo::default()
            },
            ..DdlJob::default()
        };
        for _ in 0..3 {
            puller.handle_entry(DdlEntry {
                job: Some(job.clone()),
                op_type: OpType::Put,
                commit_ts: 50,
            });
        }
        let (ts, first) = puller.pop_front_ddl();
        assert_eq!(ts, 50);
        assert!(first.is_some());
        let (_, second) = puller.pop_front_ddl();
        assert!(second.is_none());
    }

    #[test]
    fn test_resolved_ts_reporting() {
        let puller = DdlPuller::new("test-feed", 10);
        assert_eq!(puller.resolved_ts(), 10);

        puller.handle_entry(DdlEntry {
            job: None,
            op_type: OpType::Resolved,
            commit_ts: 40,
        });
        assert_eq!(puller.resolved_ts(), 40);

        // A pending job pins the resolved ts to its finished ts.
        puller.handle_entry(DdlEntry {
            job: Some(DdlJob {
                id: 1,
                binlog_info: BinlogInfo {
                    finished_ts: 30,
                    schema_version: 1,
                    ..BinlogInfo::default()
                },
                ..DdlJob::default()
            }),
            op_type: OpType::Put,
            commit_ts: 30,
        });
        assert_eq!(puller.resolved_ts(), 30);
        let (ts, job) = puller.pop_front_ddl();
        assert_eq!(ts, 30);
        assert!(job.is_some());
        assert_eq!(puller.resolved_ts(), 40);
    }
}
