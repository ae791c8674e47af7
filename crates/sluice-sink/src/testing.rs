//! Scripted connection doubles for sink tests.
//!
//! [`ScriptedDb`] records every statement executed through the
//! [`ConnPool`]/[`SinkConn`] seams, tracks transaction boundaries, and
//! injects planned failures, mirroring how the production code is driven
//! against a mocked SQL layer.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_model::SqlValue;

use crate::conn::{ConnPool, DbOpError, SinkConn};

/// One recorded statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStmt {
    /// The SQL text.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<SqlValue>,
}

#[derive(Default)]
struct ScriptedState {
    /// Outcomes popped by upcoming `execute` calls; `None` entries let a
    /// call pass so a later one can be targeted.
    execute_failures: VecDeque<Option<DbOpError>>,
    /// Failures popped by upcoming `commit` calls.
    commit_failures: VecDeque<DbOpError>,
    /// Results popped by upcoming `query` calls.
    query_results: VecDeque<Vec<Vec<SqlValue>>>,
    /// Every statement executed, in order, including failed attempts.
    executed: Vec<ExecutedStmt>,
    /// Statements of committed transactions, one entry per transaction.
    committed: Vec<Vec<ExecutedStmt>>,
    /// Number of rollbacks observed.
    rollbacks: usize,
}

/// Shared scripted database.
#[derive(Default)]
pub struct ScriptedDb {
    state: Mutex<ScriptedState>,
}

impl ScriptedDb {
    /// A fresh scripted database.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a failure for an upcoming `execute` call.
    pub fn fail_next_execute(&self, err: DbOpError) {
        self.state.lock().execute_failures.push_back(Some(err));
    }

    /// Let the next `execute` call pass, so a queued failure targets the
    /// one after it.
    pub fn pass_next_execute(&self) {
        self.state.lock().execute_failures.push_back(None);
    }

    /// Queue a failure for an upcoming `commit` call.
    pub fn fail_next_commit(&self, err: DbOpError) {
        self.state.lock().commit_failures.push_back(err);
    }

    /// Queue rows for an upcoming `query` call.
    pub fn push_query_result(&self, rows: Vec<Vec<SqlValue>>) {
        self.state.lock().query_results.push_back(rows);
    }

    /// Every executed statement, including ones whose transaction later
    /// rolled back.
    #[must_use]
    pub fn executed(&self) -> Vec<ExecutedStmt> {
        self.state.lock().executed.clone()
    }

    /// Committed transactions, each as its statement list.
    #[must_use]
    pub fn committed(&self) -> Vec<Vec<ExecutedStmt>> {
        self.state.lock().committed.clone()
    }

    /// Number of rollbacks observed.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// The pool handle handed to the code under test.
    #[must_use]
    pub fn pool(self: &Arc<Self>) -> Arc<dyn ConnPool> {
        Arc::new(ScriptedPool {
            db: Arc::clone(self),
        })
    }
}

struct ScriptedPool {
    db: Arc<ScriptedDb>,
}

#[async_trait]
impl ConnPool for ScriptedPool {
    async fn acquire(&self) -> Result<Box<dyn SinkConn>, DbOpError> {
        Ok(Box::new(ScriptedConn {
            db: Arc::clone(&self.db),
            current_txn: Vec::new(),
            in_txn: false,
        }))
    }
}

struct ScriptedConn {
    db: Arc<ScriptedDb>,
    current_txn: Vec<ExecutedStmt>,
    in_txn: bool,
}

#[async_trait]
impl SinkConn for ScriptedConn {
    async fn begin(&mut self) -> Result<(), DbOpError> {
        self.in_txn = true;
        self.current_txn.clear();
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), DbOpError> {
        let stmt = ExecutedStmt {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        let mut state = self.db.state.lock();
        state.executed.push(stmt.clone());
        if let Some(Some(err)) = state.execute_failures.pop_front() {
            return Err(err);
        }
        drop(state);
        if self.in_txn {
            self.current_txn.push(stmt);
        } else {
            self.db.state.lock().committed.push(vec![stmt]);
        }
        Ok(())
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, DbOpError> {
        let mut state = self.db.state.lock();
        state.executed.push(ExecutedStmt {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Ok(state.query_results.pop_front().unwrap_or_default())
    }

    async fn commit(&mut self) -> Result<(), DbOpError> {
        let mut state = self.db.state.lock();
        if let Some(err) = state.commit_failures.pop_front() {
            return Err(err);
        }
        state.committed.push(std::mem::take(&mut self.current_txn));
        self.in_txn = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbOpError> {
        self.db.state.lock().rollbacks += 1;
        self.current_txn.clear();
        self.in_txn = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_committed_transactions() {
        let db = ScriptedDb::new();
        let pool = db.pool();
        let mut conn = pool.acquire().await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[SqlValue::Int(1)])
            .await
            .unwrap();
        conn.commit().await.unwrap();

        let committed = db.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0][0].sql, "INSERT INTO t VALUES (?)");
    }

    #[tokio::test]
    async fn test_rollback_drops_transaction() {
        let db = ScriptedDb::new();
        let pool = db.pool();
        let mut conn = pool.acquire().await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("DELETE FROM t", &[]).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(db.committed().is_empty());
        assert_eq!(db.rollbacks(), 1);
        // The attempt itself is still visible.
        assert_eq!(db.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_pop_in_order() {
        let db = ScriptedDb::new();
        db.fail_next_execute(DbOpError::transient("boom"));
        let pool = db.pool();
        let mut conn = pool.acquire().await.unwrap();
        conn.begin().await.unwrap();
        assert!(conn.execute("X", &[]).await.is_err());
        assert!(conn.execute("X", &[]).await.is_ok());
    }
}
