//! Immutable point-in-time view of the upstream catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sluice_model::{DdlJob, TableInfo, Ts};

use crate::SchemaError;

/// A schema (database) entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMeta {
    /// Schema id.
    pub id: i64,
    /// Schema name.
    pub name: String,
}

/// An immutable catalog snapshot at one schema version.
///
/// Cloning is cheap: table metadata is shared behind `Arc`.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    version: i64,
    resolved_ts: Ts,
    schemas: HashMap<i64, SchemaMeta>,
    schemas_by_name: HashMap<String, i64>,
    tables: HashMap<i64, Arc<TableInfo>>,
    tables_by_name: HashMap<(String, String), i64>,
    /// Table ids owned by each schema, for drop-schema cascades.
    schema_tables: HashMap<i64, HashSet<i64>>,
    ineligible: HashSet<i64>,
}

impl SchemaSnapshot {
    /// An empty snapshot at version zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The schema version this snapshot captures.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The resolved watermark this snapshot was sealed at.
    #[must_use]
    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts
    }

    /// Look up a schema by id.
    #[must_use]
    pub fn schema_by_id(&self, id: i64) -> Option<&SchemaMeta> {
        self.schemas.get(&id)
    }

    /// Look up a schema id by name.
    #[must_use]
    pub fn schema_by_name(&self, name: &str) -> Option<&SchemaMeta> {
        self.schemas_by_name
            .get(name)
            .and_then(|id| self.schemas.get(id))
    }

    /// Look up a physical table by id.
    #[must_use]
    pub fn physical_table_by_id(&self, id: i64) -> Option<Arc<TableInfo>> {
        self.tables.get(&id).cloned()
    }

    /// Look up a table id by `(schema, table)` name.
    #[must_use]
    pub fn table_by_name(&self, schema: &str, table: &str) -> Option<Arc<TableInfo>> {
        self.tables_by_name
            .get(&(schema.to_string(), table.to_string()))
            .and_then(|id| self.tables.get(id))
            .cloned()
    }

    /// Whether the table lacks any unique not-null key and cannot be safely
    /// replicated without force-replicate.
    #[must_use]
    pub fn is_ineligible_table_id(&self, id: i64) -> bool {
        self.ineligible.contains(&id)
    }

    /// Populate a job's `schema_name` (and `table_name` when metadata is
    /// present) from the ids it carries.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::SchemaNotFound`] when the schema id is
    /// unknown to this snapshot.
    pub fn fill_schema_name(&self, job: &mut DdlJob) -> Result<(), SchemaError> {
        let schema = self
            .schema_by_id(job.schema_id)
            .ok_or(SchemaError::SchemaNotFound(job.schema_id))?;
        job.schema_name = schema.name.clone();
        if job.table_name.is_empty() {
            if let Some(info) = &job.binlog_info.table_info {
                job.table_name = info.name.clone();
            }
        }
        Ok(())
    }

    // ── Mutators used by SchemaStorage while building the next version. ──

    pub(crate) fn set_version(&mut self, version: i64, resolved_ts: Ts) {
        self.version = version;
        self.resolved_ts = resolved_ts;
    }

    pub(crate) fn create_schema(&mut self, id: i64, name: &str) -> Result<(), SchemaError> {
        if self.schemas.contains_key(&id) {
            return Err(SchemaError::Conflict {
                job_id: 0,
                query: String::new(),
                reason: format!("schema {id} already exists"),
            });
        }
        self.schemas.insert(
            id,
            SchemaMeta {
                id,
                name: name.to_string(),
            },
        );
        self.schemas_by_name.insert(name.to_string(), id);
        self.schema_tables.entry(id).or_default();
        Ok(())
    }

    pub(crate) fn drop_schema(&mut self, id: i64) -> Result<(), SchemaError> {
        let schema = self
            .schemas
            .remove(&id)
            .ok_or(SchemaError::SchemaNotFound(id))?;
        self.schemas_by_name.remove(&schema.name);
        for table_id in self.schema_tables.remove(&id).unwrap_or_default() {
            if let Some(info) = self.tables.remove(&table_id) {
                self.tables_by_name
                    .remove(&(schema.name.clone(), info.name.clone()));
            }
            self.ineligible.remove(&table_id);
        }
        Ok(())
    }

    pub(crate) fn put_table(
        &mut self,
        schema_id: i64,
        info: Arc<TableInfo>,
    ) -> Result<(), SchemaError> {
        let schema = self
            .schemas
            .get(&schema_id)
            .ok_or(SchemaError::SchemaNotFound(schema_id))?
            .clone();
        if info.is_eligible(false) {
            self.ineligible.remove(&info.id);
        } else {
            self.ineligible.insert(info.id);
        }
        self.tables_by_name
            .insert((schema.name, info.name.clone()), info.id);
        self.schema_tables.entry(schema_id).or_default().insert(info.id);
        self.tables.insert(info.id, info);
        Ok(())
    }

    pub(crate) fn remove_table(&mut self, table_id: i64) -> Result<Arc<TableInfo>, SchemaError> {
        let info = self
            .tables
            .remove(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        self.ineligible.remove(&table_id);
        if let Some(schema) = self.schemas.get(&info.schema_id) {
            self.tables_by_name
                .remove(&(schema.name.clone(), info.name.clone()));
        }
        if let Some(owned) = self.schema_tables.get_mut(&info.schema_id) {
            owned.remove(&table_id);
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_model::{ColumnMeta, IndexMeta};

    fn eligible_table(id: i64, schema_id: i64, name: &str) -> TableInfo {
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
            indexes: vec![IndexMeta {
                id: 1,
                name: "a".to_string(),
                column_offsets: vec![0],
                unique: true,
                primary: false,
            }],
            ..TableInfo::default()
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let mut snap = SchemaSnapshot::empty();
        snap.create_schema(1, "test").unwrap();
        snap.put_table(1, Arc::new(eligible_table(100, 1, "t1")))
            .unwrap();

        assert_eq!(snap.schema_by_id(1).unwrap().name, "test");
        assert_eq!(snap.schema_by_name("test").unwrap().id, 1);
        assert_eq!(snap.physical_table_by_id(100).unwrap().name, "t1");
        assert_eq!(snap.table_by_name("test", "t1").unwrap().id, 100);
        assert!(!snap.is_ineligible_table_id(100));
    }

    #[test]
    fn test_ineligible_tracking() {
        let mut snap = SchemaSnapshot::empty();
        snap.create_schema(1, "test").unwrap();
        let mut info = eligible_table(100, 1, "t1");
        info.indexes.clear();
        snap.put_table(1, Arc::new(info)).unwrap();
        assert!(snap.is_ineligible_table_id(100));

        // Adding a unique not-null key clears the flag.
        snap.put_table(1, Arc::new(eligible_table(100, 1, "t1")))
            .unwrap();
        assert!(!snap.is_ineligible_table_id(100));
    }

    #[test]
    fn test_drop_schema_cascades() {
        let mut snap = SchemaSnapshot::empty();
        snap.create_schema(1, "test").unwrap();
        snap.put_table(1, Arc::new(eligible_table(100, 1, "t1")))
            .unwrap();
        snap.drop_schema(1).unwrap();
        assert!(snap.schema_by_id(1).is_none());
        assert!(snap.physical_table_by_id(100).is_none());
        assert!(snap.table_by_name("test", "t1").is_none());
    }

    #[test]
    fn test_fill_schema_name() {
        let mut snap = SchemaSnapshot::empty();
        snap.create_schema(1, "test").unwrap();
        let mut job = DdlJob {
            schema_id: 1,
            binlog_info: sluice_model::BinlogInfo {
                table_info: Some(eligible_table(100, 1, "t1")),
                ..sluice_model::BinlogInfo::default()
            },
            ..DdlJob::default()
        };
        snap.fill_schema_name(&mut job).unwrap();
        assert_eq!(job.schema_name, "test");
        assert_eq!(job.table_name, "t1");

        job.schema_id = 99;
        assert!(snap.fill_schema_name(&mut job).is_err());
    }
}
