//! SQL generation for row changes.
//!
//! Two layers:
//!
//! - Per-row statements (`prepare_replace` / `prepare_update` /
//!   `prepare_delete`) with multi-VALUES REPLACE coalescing through
//!   [`reduce_replace`].
//! - Grouped batch statements (`gen_insert_sql` / `gen_delete_sql` /
//!   `gen_update_sql_fast`) used when batch DML is enabled and the table
//!   has a handle key.
//!
//! WHERE clauses use the handle-key columns; a NULL key value becomes
//! `IS NULL`. Under force-replicate, a table without a handle key falls
//! back to matching on every column.

use sluice_model::{Column, RowChange, SqlValue, TableRef};

/// Statement shape for insert-like generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertKind {
    /// Plain `INSERT`, used when the rows are known to be new downstream.
    Insert,
    /// `REPLACE`, tolerant of retries and safe mode.
    Replace,
}

impl InsertKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Replace => "REPLACE",
        }
    }
}

/// Quote a column identifier.
fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Columns that carry a value: present and not virtual generated.
fn visible_columns(cols: &[Option<Column>]) -> Vec<&Column> {
    cols.iter()
        .filter_map(Option::as_ref)
        .filter(|c| !c.flags.generated)
        .collect()
}

/// Whether the column set contains a handle-key column.
#[must_use]
pub fn has_handle_key(cols: &[Option<Column>]) -> bool {
    cols.iter()
        .filter_map(Option::as_ref)
        .any(|c| c.flags.handle_key)
}

/// The columns a WHERE clause matches on: the handle key, or every column
/// under force-replicate when no handle key exists.
fn where_columns(cols: &[Option<Column>], force_replicate: bool) -> Vec<&Column> {
    let handles: Vec<&Column> = cols
        .iter()
        .filter_map(Option::as_ref)
        .filter(|c| c.flags.handle_key)
        .collect();
    if handles.is_empty() && force_replicate {
        return visible_columns(cols);
    }
    handles
}

/// Render `col = ?` terms, turning NULL values into `IS NULL` without an
/// argument.
fn where_clause(cols: &[&Column]) -> (String, Vec<SqlValue>) {
    let mut terms = Vec::with_capacity(cols.len());
    let mut args = Vec::with_capacity(cols.len());
    for col in cols {
        if col.value.is_null() {
            terms.push(format!("{} IS NULL", quote(&col.name)));
        } else {
            terms.push(format!("{} = ?", quote(&col.name)));
            args.push(col.value.clone());
        }
    }
    (terms.join(" AND "), args)
}

/// Build a REPLACE/INSERT statement for one row.
///
/// With `append_placeholders` false the returned SQL ends at `VALUES ` and
/// doubles as the coalescing key for [`reduce_replace`].
#[must_use]
pub fn prepare_replace(
    quote_table: &str,
    cols: &[Option<Column>],
    append_placeholders: bool,
    translate_to_insert: bool,
) -> Option<(String, Vec<SqlValue>)> {
    let visible = visible_columns(cols);
    if visible.is_empty() {
        return None;
    }
    let names: Vec<String> = visible.iter().map(|c| quote(&c.name)).collect();
    let args: Vec<SqlValue> = visible.iter().map(|c| c.value.clone()).collect();

    let verb = if translate_to_insert {
        "INSERT"
    } else {
        "REPLACE"
    };
    let mut sql = format!("{verb} INTO {quote_table} ({}) VALUES ", names.join(","));
    if append_placeholders {
        sql.push_str(&placeholders(args.len()));
    }
    Some((sql, args))
}

/// Build an UPDATE statement for one row.
#[must_use]
pub fn prepare_update(
    quote_table: &str,
    pre_cols: &[Option<Column>],
    post_cols: &[Option<Column>],
    force_replicate: bool,
) -> Option<(String, Vec<SqlValue>)> {
    let set_cols = visible_columns(post_cols);
    if set_cols.is_empty() {
        return None;
    }
    let keys = where_columns(pre_cols, force_replicate);
    if keys.is_empty() {
        return None;
    }

    let set_terms: Vec<String> = set_cols
        .iter()
        .map(|c| format!("{} = ?", quote(&c.name)))
        .collect();
    let mut args: Vec<SqlValue> = set_cols.iter().map(|c| c.value.clone()).collect();
    let (where_sql, mut where_args) = where_clause(&keys);
    args.append(&mut where_args);

    let sql = format!(
        "UPDATE {quote_table} SET {} WHERE {} LIMIT 1",
        set_terms.join(", "),
        where_sql
    );
    Some((sql, args))
}

/// Build a DELETE statement for one row.
#[must_use]
pub fn prepare_delete(
    quote_table: &str,
    pre_cols: &[Option<Column>],
    force_replicate: bool,
) -> Option<(String, Vec<SqlValue>)> {
    let keys = where_columns(pre_cols, force_replicate);
    if keys.is_empty() {
        return None;
    }
    let (where_sql, args) = where_clause(&keys);
    let sql = format!("DELETE FROM {quote_table} WHERE {where_sql} LIMIT 1");
    Some((sql, args))
}

/// Cached replace rows keyed by their statement template, in insertion
/// order.
pub type ReplaceCache = Vec<(String, Vec<Vec<SqlValue>>)>;

/// Coalesce cached replace rows into multi-VALUES statements of at most
/// `batch_size` tuples each.
#[must_use]
pub fn reduce_replace(cache: &ReplaceCache, batch_size: usize) -> (Vec<String>, Vec<Vec<SqlValue>>) {
    let mut sqls = Vec::new();
    let mut values = Vec::new();
    for (template, rows) in cache {
        for chunk in rows.chunks(batch_size.max(1)) {
            let tuple = placeholders(chunk[0].len());
            let tuples: Vec<&str> = std::iter::repeat(tuple.as_str()).take(chunk.len()).collect();
            sqls.push(format!("{template}{}", tuples.join(",")));
            values.push(chunk.iter().flatten().cloned().collect());
        }
    }
    (sqls, values)
}

fn placeholders(n: usize) -> String {
    let marks: Vec<&str> = std::iter::repeat("?").take(n).collect();
    format!("({})", marks.join(","))
}

/// Render a value as a SQL literal for client-side interpolation.
///
/// Strings are quoted with MySQL escaping; byte values become hex
/// literals, which need no escaping at all.
fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::UInt(v) => v.to_string(),
        SqlValue::Double(v) => v.to_string(),
        SqlValue::Text(s) => quote_string_literal(s),
        SqlValue::Bytes(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("X'");
            for byte in b {
                out.push_str(&format!("{byte:02X}"));
            }
            out.push('\'');
            out
        }
    }
}

fn quote_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{1a}' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Substitute positional placeholders with interpolated literals.
///
/// Only safe on SQL generated by this module: generated statements carry
/// `?` exclusively in placeholder positions (values never appear inline,
/// and quoted identifiers cannot contain `?` placeholders that take
/// arguments).
///
/// Returns `None` when the placeholder count disagrees with `args`.
#[must_use]
pub fn interpolate_sql(sql: &str, args: &[SqlValue]) -> Option<String> {
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut remaining = args.iter();
    for c in sql.chars() {
        if c == '?' {
            out.push_str(&sql_literal(remaining.next()?));
        } else {
            out.push(c);
        }
    }
    if remaining.next().is_some() {
        return None;
    }
    Some(out)
}

// ── Grouped batch statements ────────────────────────────────────────

/// Multi-row INSERT/REPLACE over rows of one table.
#[must_use]
pub fn gen_insert_sql(kind: InsertKind, table: &TableRef, rows: &[&RowChange]) -> (String, Vec<SqlValue>) {
    let first = visible_columns(&rows[0].columns);
    let names: Vec<String> = first.iter().map(|c| quote(&c.name)).collect();
    let tuple = placeholders(first.len());
    let tuples: Vec<&str> = std::iter::repeat(tuple.as_str()).take(rows.len()).collect();
    let sql = format!(
        "{} INTO {} ({}) VALUES {}",
        kind.verb(),
        table.quote_string(),
        names.join(","),
        tuples.join(",")
    );
    let args = rows
        .iter()
        .flat_map(|row| visible_columns(&row.columns).into_iter().map(|c| c.value.clone()))
        .collect();
    (sql, args)
}

/// Multi-row DELETE over rows of one table, matching handle keys with a
/// tuple IN list.
#[must_use]
pub fn gen_delete_sql(table: &TableRef, rows: &[&RowChange]) -> (String, Vec<SqlValue>) {
    let keys = where_columns(&rows[0].pre_columns, false);
    let names: Vec<String> = keys.iter().map(|c| quote(&c.name)).collect();
    let tuple = placeholders(names.len());
    let tuples: Vec<&str> = std::iter::repeat(tuple.as_str()).take(rows.len()).collect();
    let sql = format!(
        "DELETE FROM {} WHERE ({}) IN ({})",
        table.quote_string(),
        names.join(","),
        tuples.join(",")
    );
    let args = rows
        .iter()
        .flat_map(|row| {
            where_columns(&row.pre_columns, false)
                .into_iter()
                .map(|c| c.value.clone())
        })
        .collect();
    (sql, args)
}

/// Multi-row UPDATE over rows of one table using CASE WHEN per column.
///
/// Only correct on TiDB; stock MySQL evaluates multi-row updates
/// differently, so callers fall back to per-row updates there.
#[must_use]
pub fn gen_update_sql_fast(table: &TableRef, rows: &[&RowChange]) -> (String, Vec<SqlValue>) {
    let key_cols = where_columns(&rows[0].pre_columns, false);
    let key_names: Vec<String> = key_cols.iter().map(|c| quote(&c.name)).collect();
    let set_cols = visible_columns(&rows[0].columns);

    let match_term = key_names
        .iter()
        .map(|name| format!("{name} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut args: Vec<SqlValue> = Vec::new();
    let mut set_terms = Vec::with_capacity(set_cols.len());
    for set_col in &set_cols {
        let mut cases = String::new();
        for row in rows {
            cases.push_str(&format!(" WHEN {match_term} THEN ?"));
            for key in where_columns(&row.pre_columns, false) {
                args.push(key.value.clone());
            }
            let value = visible_columns(&row.columns)
                .iter()
                .find(|c| c.name == set_col.name)
                .map_or(SqlValue::Null, |c| c.value.clone());
            args.push(value);
        }
        let name = quote(&set_col.name);
        set_terms.push(format!("{name} = CASE{cases} ELSE {name} END"));
    }

    let tuple = placeholders(key_names.len());
    let tuples: Vec<&str> = std::iter::repeat(tuple.as_str()).take(rows.len()).collect();
    for row in rows {
        for key in where_columns(&row.pre_columns, false) {
            args.push(key.value.clone());
        }
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE ({}) IN ({})",
        table.quote_string(),
        set_terms.join(", "),
        key_names.join(","),
        tuples.join(",")
    );
    (sql, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, value: SqlValue) -> Option<Column> {
        Some(Column::new(name, value))
    }

    fn key(name: &str, value: SqlValue) -> Option<Column> {
        Some(Column::handle(name, value))
    }

    #[test]
    fn test_prepare_replace_variants() {
        let cols = vec![key("id", SqlValue::Int(1)), col("name", SqlValue::Text("a".into()))];
        let (sql, args) = prepare_replace("`db`.`t`", &cols, true, false).unwrap();
        assert_eq!(sql, "REPLACE INTO `db`.`t` (`id`,`name`) VALUES (?,?)");
        assert_eq!(args.len(), 2);

        let (sql, _) = prepare_replace("`db`.`t`", &cols, true, true).unwrap();
        assert!(sql.starts_with("INSERT INTO"));

        // Template form for the coalescing cache.
        let (sql, _) = prepare_replace("`db`.`t`", &cols, false, false).unwrap();
        assert_eq!(sql, "REPLACE INTO `db`.`t` (`id`,`name`) VALUES ");
    }

    #[test]
    fn test_generated_columns_are_skipped() {
        let mut generated = Column::new("g", SqlValue::Int(9));
        generated.flags.generated = true;
        let cols = vec![key("id", SqlValue::Int(1)), Some(generated)];
        let (sql, args) = prepare_replace("`t`", &cols, true, false).unwrap();
        assert_eq!(sql, "REPLACE INTO `t` (`id`) VALUES (?)");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_prepare_update_uses_handle_key() {
        let pre = vec![key("id", SqlValue::Int(1)), col("name", SqlValue::Text("a".into()))];
        let post = vec![key("id", SqlValue::Int(1)), col("name", SqlValue::Text("b".into()))];
        let (sql, args) = prepare_update("`t`", &pre, &post, false).unwrap();
        assert_eq!(sql, "UPDATE `t` SET `id` = ?, `name` = ? WHERE `id` = ? LIMIT 1");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_null_key_becomes_is_null() {
        let pre = vec![key("id", SqlValue::Null)];
        let (sql, args) = prepare_delete("`t`", &pre, false).unwrap();
        assert_eq!(sql, "DELETE FROM `t` WHERE `id` IS NULL LIMIT 1");
        assert!(args.is_empty());
    }

    #[test]
    fn test_no_handle_key_needs_force_replicate() {
        let pre = vec![col("a", SqlValue::Int(1)), col("b", SqlValue::Int(2))];
        assert!(prepare_delete("`t`", &pre, false).is_none());
        let (sql, args) = prepare_delete("`t`", &pre, true).unwrap();
        assert_eq!(sql, "DELETE FROM `t` WHERE `a` = ? AND `b` = ? LIMIT 1");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(sql_literal(&SqlValue::Null), "NULL");
        assert_eq!(sql_literal(&SqlValue::Int(-5)), "-5");
        assert_eq!(sql_literal(&SqlValue::UInt(5)), "5");
        assert_eq!(
            sql_literal(&SqlValue::Text("it's\na\\test".into())),
            "'it''s\\na\\\\test'"
        );
        assert_eq!(
            sql_literal(&SqlValue::Bytes(vec![0x00, 0xff, 0x27])),
            "X'00FF27'"
        );
        assert_eq!(sql_literal(&SqlValue::Bytes(vec![])), "X''");
    }

    #[test]
    fn test_interpolate_sql() {
        let sql = "INSERT INTO `t` (`id`,`name`) VALUES (?,?);DELETE FROM `t` WHERE `id` = ?";
        let args = vec![
            SqlValue::Int(1),
            SqlValue::Text("a'b".into()),
            SqlValue::Int(2),
        ];
        assert_eq!(
            interpolate_sql(sql, &args).unwrap(),
            "INSERT INTO `t` (`id`,`name`) VALUES (1,'a''b');DELETE FROM `t` WHERE `id` = 2"
        );

        // Placeholder/argument mismatches are rejected both ways.
        assert!(interpolate_sql("SELECT ?", &[]).is_none());
        assert!(interpolate_sql("SELECT 1", &[SqlValue::Int(1)]).is_none());
    }

    #[test]
    fn test_reduce_replace_chunks_by_batch_size() {
        let template = "REPLACE INTO `t` (`id`) VALUES ".to_string();
        let cache: ReplaceCache = vec![(
            template.clone(),
            vec![
                vec![SqlValue::Int(1)],
                vec![SqlValue::Int(2)],
                vec![SqlValue::Int(3)],
            ],
        )];
        let (sqls, values) = reduce_replace(&cache, 2);
        assert_eq!(sqls.len(), 2);
        assert_eq!(sqls[0], "REPLACE INTO `t` (`id`) VALUES (?),(?)");
        assert_eq!(sqls[1], "REPLACE INTO `t` (`id`) VALUES (?)");
        assert_eq!(values[0], vec![SqlValue::Int(1), SqlValue::Int(2)]);
        assert_eq!(values[1], vec![SqlValue::Int(3)]);
    }

    fn row(table: &TableRef, id: i64, name: &str, pre: bool, post: bool) -> RowChange {
        let make = |suffix: &str| {
            vec![
                key("id", SqlValue::Int(id)),
                col("name", SqlValue::Text(format!("{name}{suffix}"))),
            ]
        };
        RowChange {
            table: table.clone(),
            pre_columns: if pre { make("") } else { vec![] },
            columns: if post { make("_new") } else { vec![] },
            commit_ts: 10,
            start_ts: 9,
            replicating_ts: 1,
            approximate_size: 32,
            index_columns: vec![vec![0]],
        }
    }

    #[test]
    fn test_gen_insert_sql_multi_values() {
        let table = TableRef::new("db", "t");
        let r1 = row(&table, 1, "a", false, true);
        let r2 = row(&table, 2, "b", false, true);
        let (sql, args) = gen_insert_sql(InsertKind::Replace, &table, &[&r1, &r2]);
        assert_eq!(
            sql,
            "REPLACE INTO `db`.`t` (`id`,`name`) VALUES (?,?),(?,?)"
        );
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_gen_delete_sql_tuple_in() {
        let table = TableRef::new("db", "t");
        let r1 = row(&table, 1, "a", true, false);
        let r2 = row(&table, 2, "b", true, false);
        let (sql, args) = gen_delete_sql(&table, &[&r1, &r2]);
        assert_eq!(sql, "DELETE FROM `db`.`t` WHERE (`id`) IN ((?),(?))");
        assert_eq!(args, vec![SqlValue::Int(1), SqlValue::Int(2)]);
    }

    #[test]
    fn test_gen_update_sql_fast_case_when() {
        let table = TableRef::new("db", "t");
        let r1 = row(&table, 1, "a", true, true);
        let r2 = row(&table, 2, "b", true, true);
        let (sql, args) = gen_update_sql_fast(&table, &[&r1, &r2]);
        assert_eq!(
            sql,
            "UPDATE `db`.`t` SET \
             `id` = CASE WHEN `id` = ? THEN ? WHEN `id` = ? THEN ? ELSE `id` END, \
             `name` = CASE WHEN `id` = ? THEN ? WHEN `id` = ? THEN ? ELSE `name` END \
             WHERE (`id`) IN ((?),(?))"
        );
        // 2 set columns × 2 rows × (key + value) + 2 where keys.
        assert_eq!(args.len(), 10);
    }
}
