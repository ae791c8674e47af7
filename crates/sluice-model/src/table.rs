//! Table metadata: column and index descriptors, handle-key designation,
//! replication eligibility.
//!
//! A table is *eligible* for replication when it has some unique not-null
//! key the sink can use as row identity. The *handle index* is the concrete
//! key chosen: the primary key when it doubles as the row handle, otherwise
//! the qualifying unique index with the smallest id.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(schema, table)` name pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema (database) name.
    pub schema: String,
    /// Table name.
    pub table: String,
}

impl TableRef {
    /// Create a table reference.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Backtick-quoted `` `schema`.`table` `` form for SQL generation.
    #[must_use]
    pub fn quote_string(&self) -> String {
        format!("{}.{}", quote_name(&self.schema), quote_name(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quote an identifier with backticks, escaping embedded backticks.
#[must_use]
pub fn quote_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A column descriptor within a [`TableInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column id, stable across non-destructive DDL.
    pub id: i64,
    /// Column name.
    pub name: String,
    /// Position of the column in the row.
    pub offset: usize,
    /// Whether the column is declared NOT NULL.
    pub not_null: bool,
    /// Source charset name; empty when not applicable.
    pub charset: String,
    /// Whether the column is generated and not stored.
    pub virtual_generated: bool,
}

/// An index descriptor within a [`TableInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Index id.
    pub id: i64,
    /// Index name.
    pub name: String,
    /// Offsets of the indexed columns within [`TableInfo::columns`].
    pub column_offsets: Vec<usize>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Whether this is the primary key.
    pub primary: bool,
}

/// Versioned metadata of one physical table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Physical table id.
    pub id: i64,
    /// Owning schema id.
    pub schema_id: i64,
    /// Table name.
    pub name: String,
    /// Columns in row order.
    pub columns: Vec<ColumnMeta>,
    /// Secondary and primary indexes.
    pub indexes: Vec<IndexMeta>,
    /// Whether the integer primary key doubles as the row handle.
    pub pk_is_handle: bool,
    /// Whether the table uses a clustered common handle.
    pub is_common_handle: bool,
    /// Whether the object is a view (always eligible, never written).
    pub is_view: bool,
    /// Whether the object is a sequence (never eligible).
    pub is_sequence: bool,
    /// Schema version the metadata was captured at.
    pub version: i64,
}

impl TableInfo {
    /// Id of the chosen handle index, or `-1` when the primary key itself is
    /// the handle, or `None` when no index qualifies.
    ///
    /// Among unique indexes whose columns are all NOT NULL and not virtual
    /// generated, the one with the smallest id wins.
    #[must_use]
    pub fn handle_index_id(&self) -> Option<i64> {
        if self.pk_is_handle || self.is_common_handle {
            return Some(-1);
        }
        self.indexes
            .iter()
            .filter(|idx| idx.unique && self.index_usable_as_handle(idx))
            .map(|idx| idx.id)
            .min()
    }

    fn index_usable_as_handle(&self, index: &IndexMeta) -> bool {
        index.column_offsets.iter().all(|&off| {
            self.columns
                .get(off)
                .is_some_and(|col| col.not_null && !col.virtual_generated)
        })
    }

    /// Whether some unique not-null key exists.
    #[must_use]
    pub fn exists_unique_not_null_key(&self) -> bool {
        self.handle_index_id().is_some()
    }

    /// Whether the table can be replicated.
    ///
    /// Views are eligible (they produce no row events); sequences never are.
    /// With `force_replicate` a table without a unique not-null key is
    /// accepted anyway.
    #[must_use]
    pub fn is_eligible(&self, force_replicate: bool) -> bool {
        if self.is_sequence {
            return false;
        }
        if self.is_view {
            return true;
        }
        force_replicate || self.exists_unique_not_null_key()
    }

    /// Look up a column by id.
    #[must_use]
    pub fn column_by_id(&self, id: i64) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Resolve column offsets for a list of names, case-insensitively.
    ///
    /// Returns `None` when any name is unknown.
    #[must_use]
    pub fn offsets_by_names(&self, names: &[&str]) -> Option<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .map(|c| c.offset)
            })
            .collect()
    }
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TableInfo(id={}, name={}, cols={}, idx={})",
            self.id,
            self.name,
            self.columns.len(),
            self.indexes.len()
        )
    }
}
