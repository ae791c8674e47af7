//! Connection seams over the downstream database.
//!
//! The batching and checkpoint logic runs against [`ConnPool`] and
//! [`SinkConn`]; [`MysqlPool`] is the production implementation over a
//! `mysql_async` pool, and [`crate::testing::ScriptedDb`] scripts the same
//! traits for tests.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use sluice_model::SqlValue;

/// Classified downstream error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Duplicate key (MySQL 1062). Non-retryable.
    DuplicateEntry,
    /// Unknown table (MySQL 1146). Non-retryable.
    UnknownTable,
    /// Unknown database (MySQL 1049). Non-retryable.
    UnknownDatabase,
    /// Unknown system variable (MySQL 1193). Tolerated when probing
    /// optional variables.
    UnknownSystemVariable,
    /// Everything else: connection drops, timeouts, deadlocks. Retryable.
    Transient,
    /// The operation was cancelled from our side.
    Cancelled,
}

/// A classified downstream operation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DbOpError {
    /// Classified kind.
    pub kind: DbErrorKind,
    /// Driver message.
    pub message: String,
}

impl DbOpError {
    /// A transient failure with the given message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A failure of the given kind.
    #[must_use]
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One downstream connection with explicit transaction control.
#[async_trait]
pub trait SinkConn: Send {
    /// Open a transaction.
    async fn begin(&mut self) -> Result<(), DbOpError>;

    /// Execute a statement with positional parameters.
    ///
    /// With parameters the statement goes over the prepared-statement
    /// protocol, which accepts a single statement. Without parameters it
    /// goes over the text protocol, which also carries `;`-joined
    /// multi-statement batches (with any values interpolated by the
    /// caller).
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), DbOpError>;

    /// Run a query, returning rows of raw values.
    async fn query(&mut self, sql: &str, params: &[SqlValue])
        -> Result<Vec<Vec<SqlValue>>, DbOpError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), DbOpError>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), DbOpError>;
}

/// Hands out downstream connections.
#[async_trait]
pub trait ConnPool: Send + Sync {
    /// Acquire a connection.
    async fn acquire(&self) -> Result<Box<dyn SinkConn>, DbOpError>;
}

// ── mysql_async implementation ──────────────────────────────────────

/// MySQL error numbers the sink classifies.
mod er {
    pub const DUP_ENTRY: u16 = 1062;
    pub const BAD_DB: u16 = 1049;
    pub const NO_SUCH_TABLE: u16 = 1146;
    pub const UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
}

fn classify(err: &mysql_async::Error) -> DbErrorKind {
    if let mysql_async::Error::Server(server) = err {
        match server.code {
            er::DUP_ENTRY => DbErrorKind::DuplicateEntry,
            er::BAD_DB => DbErrorKind::UnknownDatabase,
            er::NO_SUCH_TABLE => DbErrorKind::UnknownTable,
            er::UNKNOWN_SYSTEM_VARIABLE => DbErrorKind::UnknownSystemVariable,
            _ => DbErrorKind::Transient,
        }
    } else {
        DbErrorKind::Transient
    }
}

fn map_err(err: mysql_async::Error) -> DbOpError {
    DbOpError {
        kind: classify(&err),
        message: err.to_string(),
    }
}

fn to_driver_value(value: &SqlValue) -> mysql_async::Value {
    match value {
        SqlValue::Null => mysql_async::Value::NULL,
        SqlValue::Bytes(b) => mysql_async::Value::Bytes(b.clone()),
        SqlValue::Text(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        SqlValue::Int(v) => mysql_async::Value::Int(*v),
        SqlValue::UInt(v) => mysql_async::Value::UInt(*v),
        SqlValue::Double(v) => mysql_async::Value::Double(*v),
    }
}

fn from_driver_value(value: mysql_async::Value) -> SqlValue {
    match value {
        mysql_async::Value::NULL => SqlValue::Null,
        mysql_async::Value::Bytes(b) => SqlValue::Bytes(b),
        mysql_async::Value::Int(v) => SqlValue::Int(v),
        mysql_async::Value::UInt(v) => SqlValue::UInt(v),
        mysql_async::Value::Float(v) => SqlValue::Double(f64::from(v)),
        mysql_async::Value::Double(v) => SqlValue::Double(v),
        other => SqlValue::Text(format!("{other:?}")),
    }
}

fn to_params(params: &[SqlValue]) -> mysql_async::Params {
    if params.is_empty() {
        mysql_async::Params::Empty
    } else {
        mysql_async::Params::Positional(params.iter().map(to_driver_value).collect())
    }
}

struct MysqlSinkConn {
    conn: mysql_async::Conn,
}

#[async_trait]
impl SinkConn for MysqlSinkConn {
    async fn begin(&mut self) -> Result<(), DbOpError> {
        self.conn.query_drop("BEGIN").await.map_err(map_err)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), DbOpError> {
        if params.is_empty() {
            // Text protocol; `query_drop` drains every result set of a
            // multi-statement batch.
            self.conn.query_drop(sql).await.map_err(map_err)
        } else {
            self.conn
                .exec_drop(sql, to_params(params))
                .await
                .map_err(map_err)
        }
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, DbOpError> {
        let rows: Vec<mysql_async::Row> = self
            .conn
            .exec(sql, to_params(params))
            .await
            .map_err(map_err)?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(from_driver_value).collect())
            .collect())
    }

    async fn commit(&mut self) -> Result<(), DbOpError> {
        self.conn.query_drop("COMMIT").await.map_err(map_err)
    }

    async fn rollback(&mut self) -> Result<(), DbOpError> {
        self.conn.query_drop("ROLLBACK").await.map_err(map_err)
    }
}

/// `mysql_async` connection pool sized to the sink worker count.
pub struct MysqlPool {
    pool: mysql_async::Pool,
}

impl MysqlPool {
    /// Build a pool from a connection URL, capped at `worker_count`
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns a [`DbOpError`] when the URL does not parse.
    pub fn connect(url: &str, worker_count: usize) -> Result<Self, DbOpError> {
        let opts = mysql_async::Opts::from_url(url)
            .map_err(|e| DbOpError::transient(e.to_string()))?;
        let constraints = mysql_async::PoolConstraints::new(1, worker_count.max(1))
            .ok_or_else(|| DbOpError::transient("invalid pool constraints"))?;
        let pool_opts = mysql_async::PoolOpts::default().with_constraints(constraints);
        let opts = mysql_async::OptsBuilder::from_opts(opts)
            .pool_opts(pool_opts)
            .into();
        Ok(Self {
            pool: mysql_async::Pool::new::<mysql_async::Opts>(opts),
        })
    }

    /// Query `@@max_allowed_packet` once at startup.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn query_max_allowed_packet(&self) -> Result<i64, DbOpError> {
        let mut conn = self.pool.get_conn().await.map_err(map_err)?;
        let value: Option<i64> = conn
            .query_first("SELECT @@global.max_allowed_packet")
            .await
            .map_err(map_err)?;
        value.ok_or_else(|| DbOpError::transient("max_allowed_packet not reported"))
    }

    /// Whether the downstream is TiDB, detected once at startup.
    ///
    /// # Errors
    ///
    /// Propagates driver failures other than the missing function.
    pub async fn check_is_tidb(&self) -> Result<bool, DbOpError> {
        let mut conn = self.pool.get_conn().await.map_err(map_err)?;
        match conn
            .query_first::<String, _>("SELECT tidb_version()")
            .await
        {
            Ok(version) => Ok(version.is_some()),
            Err(mysql_async::Error::Server(_)) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Whether the downstream accepts the CDC write-source session
    /// variable, detected once at startup.
    ///
    /// # Errors
    ///
    /// Propagates driver failures other than the unknown variable.
    pub async fn check_write_source_available(&self) -> Result<bool, DbOpError> {
        let mut conn = self.pool.get_conn().await.map_err(map_err)?;
        match conn
            .query_drop("SELECT @@session.tidb_cdc_write_source")
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if classify(&e) == DbErrorKind::UnknownSystemVariable => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }
}

#[async_trait]
impl ConnPool for MysqlPool {
    async fn acquire(&self) -> Result<Box<dyn SinkConn>, DbOpError> {
        let conn = self.pool.get_conn().await.map_err(map_err)?;
        Ok(Box::new(MysqlSinkConn { conn }))
    }
}
