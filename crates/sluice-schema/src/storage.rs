//! The versioned snapshot store.
//!
//! Writers (the DDL puller) serialize through [`SchemaStorage::handle_ddl_job`];
//! readers take cheap snapshot clones and never block writers for long. The
//! resolved watermark advances lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sluice_model::{DdlJob, DdlJobType, RenameTablesArgs, TableInfo, Ts};

use crate::snapshot::SchemaSnapshot;
use crate::SchemaError;

/// How many historical snapshots to retain for point-in-time lookup.
const SNAPSHOT_RETENTION: usize = 128;

/// Versioned catalog store shared between the DDL puller and event decoding.
#[derive(Debug)]
pub struct SchemaStorage {
    snapshots: RwLock<Vec<Arc<SchemaSnapshot>>>,
    resolved_ts: AtomicU64,
}

impl Default for SchemaStorage {
    fn default() -> Self {
        Self::new(SchemaSnapshot::empty())
    }
}

impl SchemaStorage {
    /// Create a store seeded with a bootstrap snapshot.
    #[must_use]
    pub fn new(initial: SchemaSnapshot) -> Self {
        let resolved = initial.resolved_ts();
        Self {
            snapshots: RwLock::new(vec![Arc::new(initial)]),
            resolved_ts: AtomicU64::new(resolved),
        }
    }

    /// The most recent snapshot.
    #[must_use]
    pub fn last_snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshots
            .read()
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(SchemaSnapshot::empty()))
    }

    /// The highest snapshot whose version is at or below `ts`.
    ///
    /// Falls back to the oldest retained snapshot when `ts` predates
    /// retention.
    #[must_use]
    pub fn snapshot_at(&self, ts: Ts) -> Arc<SchemaSnapshot> {
        let snapshots = self.snapshots.read();
        #[allow(clippy::cast_possible_wrap)]
        let ts = ts as i64;
        snapshots
            .iter()
            .rev()
            .find(|snap| snap.version() <= ts)
            .or_else(|| snapshots.first())
            .cloned()
            .unwrap_or_else(|| Arc::new(SchemaSnapshot::empty()))
    }

    /// Current resolved watermark.
    #[must_use]
    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    /// Advance the resolved watermark. Regressions are ignored.
    pub fn advance_resolved_ts(&self, ts: Ts) {
        self.resolved_ts.fetch_max(ts, Ordering::AcqRel);
    }

    /// Apply a DDL job, producing the next snapshot version.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Conflict`] when the job disagrees with the
    /// current snapshot (dropping a missing table, creating a duplicate
    /// schema), and [`SchemaError::MissingTableInfo`] when a table DDL
    /// carries no metadata.
    pub fn handle_ddl_job(&self, job: &DdlJob) -> Result<(), SchemaError> {
        let mut snapshots = self.snapshots.write();
        let mut next = snapshots
            .last()
            .map_or_else(SchemaSnapshot::empty, |s| (**s).clone());

        self.apply(&mut next, job).map_err(|e| match e {
            SchemaError::SchemaNotFound(_) | SchemaError::TableNotFound(_) => {
                SchemaError::Conflict {
                    job_id: job.id,
                    query: job.query.clone(),
                    reason: e.to_string(),
                }
            }
            other => other,
        })?;

        next.set_version(job.binlog_info.schema_version, job.binlog_info.finished_ts);
        snapshots.push(Arc::new(next));
        if snapshots.len() > SNAPSHOT_RETENTION {
            let excess = snapshots.len() - SNAPSHOT_RETENTION;
            snapshots.drain(..excess);
        }

        tracing::debug!(
            job_id = job.id,
            job_type = ?job.job_type,
            schema_version = job.binlog_info.schema_version,
            query = %job.query,
            "Applied DDL job"
        );
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn apply(&self, next: &mut SchemaSnapshot, job: &DdlJob) -> Result<(), SchemaError> {
        let table_info = || {
            job.binlog_info
                .table_info
                .clone()
                .ok_or(SchemaError::MissingTableInfo(job.id))
        };

        match job.job_type {
            DdlJobType::CreateSchema => next.create_schema(job.schema_id, &job.schema_name),
            DdlJobType::DropSchema => next.drop_schema(job.schema_id),
            DdlJobType::ModifySchema => {
                // Charset / option changes carry no catalog delta we track.
                next.schema_by_id(job.schema_id)
                    .map(|_| ())
                    .ok_or(SchemaError::SchemaNotFound(job.schema_id))
            }
            DdlJobType::CreateTable | DdlJobType::RecoverTable => {
                let info = table_info()?;
                if next.physical_table_by_id(info.id).is_some() {
                    return Err(SchemaError::Conflict {
                        job_id: job.id,
                        query: job.query.clone(),
                        reason: format!("table {} already exists", info.id),
                    });
                }
                next.put_table(job.schema_id, Arc::new(info))
            }
            DdlJobType::CreateTables => {
                for info in &job.binlog_info.multi_table_infos {
                    next.put_table(info.schema_id, Arc::new(info.clone()))?;
                }
                Ok(())
            }
            DdlJobType::DropTable => {
                next.remove_table(job.table_id)?;
                Ok(())
            }
            DdlJobType::TruncateTable => {
                // Truncate swaps the physical table id: drop the old id,
                // insert the new metadata.
                next.remove_table(job.table_id)?;
                let info = table_info()?;
                next.put_table(job.schema_id, Arc::new(info))
            }
            DdlJobType::RenameTable => {
                next.remove_table(job.table_id)?;
                let mut info = table_info()?;
                info.schema_id = job.schema_id;
                next.put_table(job.schema_id, Arc::new(info))
            }
            DdlJobType::RenameTables => {
                let args = RenameTablesArgs::decode(job).map_err(|e| SchemaError::Conflict {
                    job_id: job.id,
                    query: job.query.clone(),
                    reason: e.to_string(),
                })?;
                if args.len() != job.binlog_info.multi_table_infos.len() {
                    return Err(SchemaError::Conflict {
                        job_id: job.id,
                        query: job.query.clone(),
                        reason: "rename children disagree with table infos".to_string(),
                    });
                }
                for (i, info) in job.binlog_info.multi_table_infos.iter().enumerate() {
                    next.remove_table(args.old_table_ids[i])?;
                    let mut info: TableInfo = info.clone();
                    info.schema_id = args.new_schema_ids[i];
                    info.name.clone_from(&args.new_table_names[i]);
                    next.put_table(args.new_schema_ids[i], Arc::new(info))?;
                }
                Ok(())
            }
            DdlJobType::AddColumn
            | DdlJobType::DropColumn
            | DdlJobType::ModifyColumn
            | DdlJobType::AddIndex
            | DdlJobType::DropIndex
            | DdlJobType::ExchangeTablePartition => {
                // Metadata-replacing DDLs: the job carries the resulting
                // table info wholesale.
                next.physical_table_by_id(job.table_id)
                    .ok_or(SchemaError::TableNotFound(job.table_id))?;
                let info = table_info()?;
                next.put_table(job.schema_id, Arc::new(info))
            }
        }
    }
}
