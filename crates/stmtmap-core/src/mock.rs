//! Scriptable in-memory driver for deterministic tests without a database.
//!
//! Statements never touch storage: `exec` reports one affected row, and
//! `query` yields a single row echoing the statement's query text followed
//! by its arguments. Failures are injected per query text.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::driver::{Connection, Statement};
use crate::value::{ExecOutcome, Row, Value};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MockError {
    #[error("mock prepare failed: {0}")]
    Prepare(String),
    #[error("mock exec failed: {0}")]
    Exec(String),
    #[error("mock close failed: {0}")]
    Close(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("statement is closed")]
    StatementClosed,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Default)]
struct MockState {
    prepared: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    closed_statements: Mutex<Vec<String>>,
    fail_prepare: Mutex<HashSet<String>>,
    fail_exec: Mutex<HashSet<String>>,
    /// Remaining close failures per query text.
    fail_close: Mutex<HashMap<String, usize>>,
    fail_connection_close: AtomicUsize,
    closed: AtomicBool,
    /// Successful prepares/execs left before the token fires.
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl MockState {
    fn take_close_failure(&self, query: &str) -> bool {
        let mut failures = self.fail_close.lock();
        match failures.get_mut(query) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn record_call(&self) {
        let mut pending = self.cancel_after.lock();
        let fire = match pending.as_mut() {
            Some((remaining, _)) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if fire {
            if let Some((_, token)) = pending.take() {
                token.cancel();
            }
        }
    }
}

/// Mock connection. Clones share the same state, so a test can keep one
/// clone for scripting and inspection while the registry owns another.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `prepare` fail for this exact query text.
    pub fn fail_prepare(&self, query: &str) {
        self.state.fail_prepare.lock().insert(query.to_string());
    }

    /// Make raw `exec` and statement `exec`/`query` fail for this query text.
    pub fn fail_exec(&self, query: &str) {
        self.state.fail_exec.lock().insert(query.to_string());
    }

    /// Make the next `times` closes of statements with this query text fail.
    pub fn fail_close(&self, query: &str, times: usize) {
        self.state.fail_close.lock().insert(query.to_string(), times);
    }

    /// Cancel `token` right after the `calls`-th successful prepare or exec.
    pub fn cancel_after(&self, calls: usize, token: &CancellationToken) {
        *self.state.cancel_after.lock() = Some((calls, token.clone()));
    }

    pub fn fail_connection_close(&self, times: usize) {
        self.state.fail_connection_close.store(times, Ordering::SeqCst);
    }

    /// Query texts passed to `prepare`, in call order.
    pub fn prepared(&self) -> Vec<String> {
        self.state.prepared.lock().clone()
    }

    /// Query texts that executed successfully (raw and prepared), in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    pub fn closed_statements(&self) -> Vec<String> {
        self.state.closed_statements.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn check(&self, cancel: &CancellationToken) -> Result<(), MockError> {
        if self.is_closed() {
            return Err(MockError::ConnectionClosed);
        }
        if cancel.is_cancelled() {
            return Err(MockError::Cancelled);
        }
        Ok(())
    }

    fn run(&self, query: &str) -> Result<ExecOutcome, MockError> {
        if self.state.fail_exec.lock().contains(query) {
            return Err(MockError::Exec(query.to_string()));
        }
        self.state.executed.lock().push(query.to_string());
        self.state.record_call();
        Ok(ExecOutcome {
            rows_affected: 1,
            last_insert_id: None,
        })
    }
}

impl Connection for MockConnection {
    type Error = MockError;
    type Statement = MockStatement;

    fn prepare(&self, query: &str, cancel: &CancellationToken) -> Result<MockStatement, MockError> {
        self.check(cancel)?;
        self.state.prepared.lock().push(query.to_string());
        if self.state.fail_prepare.lock().contains(query) {
            return Err(MockError::Prepare(query.to_string()));
        }
        self.state.record_call();
        Ok(MockStatement {
            query: query.to_string(),
            conn: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn exec(
        &self,
        query: &str,
        _args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, MockError> {
        self.check(cancel)?;
        self.run(query)
    }

    fn close(&self) -> Result<(), MockError> {
        let remaining = self.state.fail_connection_close.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .fail_connection_close
                .store(remaining - 1, Ordering::SeqCst);
            return Err(MockError::Close("connection".into()));
        }
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockStatement {
    query: String,
    conn: MockConnection,
    closed: AtomicBool,
}

impl MockStatement {
    fn check(&self, cancel: &CancellationToken) -> Result<(), MockError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MockError::StatementClosed);
        }
        self.conn.check(cancel)
    }
}

impl Statement for MockStatement {
    type Error = MockError;
    type Rows = std::vec::IntoIter<Result<Row, MockError>>;

    fn exec(&self, _args: &[Value], cancel: &CancellationToken) -> Result<ExecOutcome, MockError> {
        self.check(cancel)?;
        self.conn.run(&self.query)
    }

    fn query(&self, args: &[Value], cancel: &CancellationToken) -> Result<Self::Rows, MockError> {
        self.check(cancel)?;
        if self.conn.state.fail_exec.lock().contains(&self.query) {
            return Err(MockError::Exec(self.query.clone()));
        }
        let columns: Vec<String> = std::iter::once("query".to_string())
            .chain((0..args.len()).map(|i| format!("arg{i}")))
            .collect();
        let values = std::iter::once(Value::Text(self.query.clone()))
            .chain(args.iter().cloned())
            .collect();
        Ok(vec![Ok(Row::new(columns.into(), values))].into_iter())
    }

    fn close(&self) -> Result<(), MockError> {
        if self.conn.state.take_close_failure(&self.query) {
            return Err(MockError::Close(self.query.clone()));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.conn
            .state
            .closed_statements
            .lock()
            .push(self.query.clone());
        Ok(())
    }
}
