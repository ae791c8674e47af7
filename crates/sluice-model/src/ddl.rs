//! DDL jobs pulled from the upstream system job queue.

use serde::{Deserialize, Serialize};

use crate::table::TableInfo;
use crate::{ModelError, Ts};

/// The kind of a DDL job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DdlJobType {
    /// CREATE SCHEMA / DATABASE.
    CreateSchema,
    /// DROP SCHEMA / DATABASE.
    DropSchema,
    /// ALTER SCHEMA options (charset etc.).
    ModifySchema,
    /// CREATE TABLE.
    CreateTable,
    /// Batch CREATE TABLE (multiple tables in one job).
    CreateTables,
    /// DROP TABLE.
    DropTable,
    /// TRUNCATE TABLE (swaps the physical table id).
    TruncateTable,
    /// RENAME TABLE with a single child.
    RenameTable,
    /// RENAME TABLE with multiple children in one job.
    RenameTables,
    /// RECOVER TABLE.
    RecoverTable,
    /// ALTER TABLE ADD COLUMN.
    AddColumn,
    /// ALTER TABLE DROP COLUMN.
    DropColumn,
    /// ALTER TABLE MODIFY COLUMN.
    ModifyColumn,
    /// ALTER TABLE ADD INDEX.
    AddIndex,
    /// ALTER TABLE DROP INDEX.
    DropIndex,
    /// ALTER TABLE EXCHANGE PARTITION.
    ExchangeTablePartition,
}

impl DdlJobType {
    /// Whether the job targets a schema rather than a table.
    #[must_use]
    pub fn is_schema_ddl(self) -> bool {
        matches!(
            self,
            Self::CreateSchema | Self::DropSchema | Self::ModifySchema
        )
    }
}

/// Commit-time metadata attached to a finished DDL job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinlogInfo {
    /// Commit timestamp the job finished at.
    pub finished_ts: Ts,
    /// Schema version produced by the job. Zero means the job was ignored
    /// upstream.
    pub schema_version: i64,
    /// Resulting table metadata, absent for schema DDLs and drops.
    pub table_info: Option<TableInfo>,
    /// Resulting metadata per child for multi-table jobs.
    pub multi_table_infos: Vec<TableInfo>,
}

/// A DDL job decoded from the system job queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DdlJob {
    /// Job id, unique and increasing upstream.
    pub id: i64,
    /// The kind of job.
    pub job_type: DdlJobType,
    /// Owning schema id.
    pub schema_id: i64,
    /// Owning schema name; may be empty until filled from the snapshot.
    pub schema_name: String,
    /// Target table id; zero for schema DDLs.
    pub table_id: i64,
    /// Target table name; may be empty until filled from the snapshot.
    pub table_name: String,
    /// The original DDL statement.
    pub query: String,
    /// Commit-time metadata.
    pub binlog_info: BinlogInfo,
    /// Raw job arguments as stored upstream (JSON array).
    #[serde(default)]
    pub raw_args: serde_json::Value,
}

impl Default for DdlJobType {
    fn default() -> Self {
        Self::CreateTable
    }
}

/// The five parallel argument arrays of a multi-table rename job.
///
/// Index `i` across all five arrays describes child `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameTablesArgs {
    /// Schema ids the children are renamed out of.
    pub old_schema_ids: Vec<i64>,
    /// Schema ids the children are renamed into.
    pub new_schema_ids: Vec<i64>,
    /// New table names.
    pub new_table_names: Vec<String>,
    /// Physical table ids of the children.
    pub old_table_ids: Vec<i64>,
    /// Schema names the children are renamed out of.
    pub old_schema_names: Vec<String>,
}

impl RenameTablesArgs {
    /// Decode the arrays from a job's raw arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidDdlJob`] when the payload is not a
    /// five-element array or any element has the wrong shape, and when the
    /// decoded arrays disagree in length.
    pub fn decode(job: &DdlJob) -> Result<Self, ModelError> {
        let invalid = |reason: &str| ModelError::InvalidDdlJob {
            job_id: job.id,
            reason: reason.to_string(),
        };
        let args = job
            .raw_args
            .as_array()
            .ok_or_else(|| invalid("raw args is not an array"))?;
        if args.len() != 5 {
            return Err(invalid("raw args does not have five elements"));
        }
        let decoded = Self {
            old_schema_ids: serde_json::from_value(args[0].clone())?,
            new_schema_ids: serde_json::from_value(args[1].clone())?,
            new_table_names: serde_json::from_value(args[2].clone())?,
            old_table_ids: serde_json::from_value(args[3].clone())?,
            old_schema_names: serde_json::from_value(args[4].clone())?,
        };
        let n = decoded.old_schema_ids.len();
        if decoded.new_schema_ids.len() != n
            || decoded.new_table_names.len() != n
            || decoded.old_table_ids.len() != n
            || decoded.old_schema_names.len() != n
        {
            return Err(invalid("rename argument arrays disagree in length"));
        }
        Ok(decoded)
    }

    /// Number of child renames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.old_schema_ids.len()
    }

    /// Whether no children remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.old_schema_ids.is_empty()
    }

    /// Re-encode the arrays as a job raw-argument payload.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Json`] when serialization fails.
    pub fn encode(&self) -> Result<serde_json::Value, ModelError> {
        Ok(serde_json::json!([
            self.old_schema_ids,
            self.new_schema_ids,
            self.new_table_names,
            self.old_table_ids,
            self.old_schema_names,
        ]))
    }
}
