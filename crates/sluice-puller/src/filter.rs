//! Replication filter: which schemas and tables a stream carries.
//!
//! Rules are an allowlist of `schema.table` patterns. A trailing `*`
//! matches any suffix; matching is case-insensitive. System schemas are
//! always ignored regardless of rules.

use sluice_model::DdlJobType;

/// Schemas that are never replicated.
const SYSTEM_SCHEMAS: &[&str] = &[
    "information_schema",
    "performance_schema",
    "mysql",
    "sys",
    "metrics_schema",
    "inspection_schema",
];

/// Decides which DDL jobs and tables a replication stream keeps.
pub trait TableFilter: Send + Sync {
    /// Whether a table is outside the replicated set.
    fn should_ignore_table(&self, schema: &str, table: &str) -> bool;

    /// Whether a DDL job should be discarded.
    ///
    /// Schema DDLs match on the schema name only.
    fn should_discard_ddl(&self, job_type: DdlJobType, schema: &str, table: &str) -> bool {
        if job_type.is_schema_ddl() {
            self.should_ignore_table(schema, "")
        } else {
            self.should_ignore_table(schema, table)
        }
    }
}

/// One `schema.table` allowlist pattern.
#[derive(Debug, Clone)]
struct Rule {
    schema: String,
    table: String,
}

/// Allowlist filter over `schema.table` patterns.
#[derive(Debug, Clone)]
pub struct RuleFilter {
    rules: Vec<Rule>,
}

impl RuleFilter {
    /// Accept everything outside the system schemas.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::new(&["*.*"])
    }

    /// Build a filter from `schema.table` patterns. A pattern without a dot
    /// matches every table in the schema.
    #[must_use]
    pub fn new(patterns: &[&str]) -> Self {
        let rules = patterns
            .iter()
            .map(|p| {
                let (schema, table) = p.split_once('.').unwrap_or((p, "*"));
                Rule {
                    schema: schema.to_ascii_lowercase(),
                    table: table.to_ascii_lowercase(),
                }
            })
            .collect();
        Self { rules }
    }
}

impl TableFilter for RuleFilter {
    fn should_ignore_table(&self, schema: &str, table: &str) -> bool {
        let schema = schema.to_ascii_lowercase();
        if SYSTEM_SCHEMAS.contains(&schema.as_str()) {
            return true;
        }
        let table = table.to_ascii_lowercase();
        !self
            .rules
            .iter()
            .any(|rule| matches(&rule.schema, &schema) && (table.is_empty() || matches(&rule.table, &table)))
    }
}

/// Case-folded pattern match: exact, or a trailing-`*` prefix wildcard.
fn matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        pattern == name
    }
}
