use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, CachedStatement, Connection as RawConnection, Statement as RawStatement};
use stmtmap_core::{ExecOutcome, Row, Statement, Value};
use tokio_util::sync::CancellationToken;

use crate::connection::SharedConnection;
use crate::error::SqliteError;

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

/// Run `stmt` to completion. Statements that return rows (`SELECT`,
/// `PRAGMA`, `... RETURNING`) are stepped through and their rows dropped.
pub(crate) fn execute_discarding_rows(
    conn: &RawConnection,
    stmt: &mut RawStatement<'_>,
    args: &[Value],
) -> Result<ExecOutcome, SqliteError> {
    let params = params_from_iter(args.iter().map(to_sql_value));
    let rows_affected = if stmt.column_count() > 0 {
        let before = conn.total_changes();
        let mut rows = stmt.query(params)?;
        while rows.next()?.is_some() {}
        drop(rows);
        conn.total_changes() - before
    } else {
        stmt.execute(params)? as u64
    };
    Ok(ExecOutcome {
        rows_affected,
        last_insert_id: Some(conn.last_insert_rowid()),
    })
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// A statement registered against a [`SqliteConnection`](crate::SqliteConnection).
///
/// Holds the SQL text and fetches the compiled statement from the
/// connection's cache on each call, so it never borrows the connection.
#[derive(Debug)]
pub struct SqliteStatement {
    conn: SharedConnection,
    sql: String,
    closed: AtomicBool,
}

impl SqliteStatement {
    pub(crate) fn new(conn: SharedConnection, sql: &str) -> Self {
        Self {
            conn,
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn with_cached<F, T>(&self, cancel: &CancellationToken, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&RawConnection, &mut CachedStatement<'_>) -> Result<T, SqliteError>,
    {
        if self.is_closed() {
            return Err(SqliteError::StatementClosed);
        }
        if cancel.is_cancelled() {
            return Err(SqliteError::Cancelled);
        }
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(SqliteError::ConnectionClosed)?;
        let mut stmt = conn.prepare_cached(&self.sql)?;
        f(conn, &mut stmt)
    }
}

/// Rows of a finished query, yielded once in result order.
#[derive(Debug)]
pub struct SqliteRows {
    rows: std::vec::IntoIter<Row>,
}

impl Iterator for SqliteRows {
    type Item = Result<Row, SqliteError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl Statement for SqliteStatement {
    type Error = SqliteError;
    type Rows = SqliteRows;

    fn exec(&self, args: &[Value], cancel: &CancellationToken) -> Result<ExecOutcome, SqliteError> {
        self.with_cached(cancel, |conn, stmt| execute_discarding_rows(conn, stmt, args))
    }

    /// Rows are read while the connection lock is held and handed back as
    /// an owned cursor, so memory grows with the size of the result and
    /// other users of the connection wait until the last row is read.
    /// Cancellation is checked between rows.
    fn query(&self, args: &[Value], cancel: &CancellationToken) -> Result<SqliteRows, SqliteError> {
        self.with_cached(cancel, |_, stmt| {
            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut rows = stmt.query(params_from_iter(args.iter().map(to_sql_value)))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if cancel.is_cancelled() {
                    return Err(SqliteError::Cancelled);
                }
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i).map(from_value_ref))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(Row::new(columns.clone(), values));
            }
            Ok(SqliteRows {
                rows: out.into_iter(),
            })
        })
    }

    /// Marks the handle unusable. The compiled statement stays in the
    /// connection's cache until evicted or the connection closes.
    fn close(&self) -> Result<(), SqliteError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stmtmap_core::{args, Connection, RegistryError};

    use super::*;
    use crate::SqliteConnection;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn people() -> SqliteConnection {
        let db = SqliteConnection::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, avatar BLOB);
                 INSERT INTO people (name, score, avatar) VALUES ('ada', 9.5, x'0102');
                 INSERT INTO people (name, score, avatar) VALUES ('bob', NULL, NULL);",
            )?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn query_maps_every_storage_class() {
        let db = people();
        let stmt = db
            .prepare("SELECT id, name, score, avatar FROM people ORDER BY id", &cancel())
            .unwrap();
        let rows: Vec<Row> = stmt
            .query(&[], &cancel())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns(), ["id", "name", "score", "avatar"]);
        assert_eq!(
            rows[0].values(),
            [
                Value::Integer(1),
                Value::Text("ada".into()),
                Value::Real(9.5),
                Value::Blob(vec![1, 2]),
            ]
        );
        assert!(rows[1].values()[2].is_null());
    }

    #[test]
    fn query_binds_arguments() {
        let db = people();
        let stmt = db
            .prepare("SELECT name FROM people WHERE id = ?1", &cancel())
            .unwrap();
        let name: String = stmt.query_row(&args![2], &cancel()).scan(0).unwrap();
        assert_eq!(name, "bob");
    }

    #[test]
    fn query_row_without_match_is_no_rows() {
        let db = people();
        let stmt = db
            .prepare("SELECT name FROM people WHERE id = ?1", &cancel())
            .unwrap();
        let pending = stmt.query_row(&args![99], &cancel());
        assert!(matches!(pending.row(), Err(RegistryError::NoRows)));
    }

    #[test]
    fn exec_reuses_cached_statement() {
        let db = people();
        let stmt = db
            .prepare("INSERT INTO people (name) VALUES (?1)", &cancel())
            .unwrap();
        for name in ["cy", "di", "ed"] {
            let outcome = stmt.exec(&args![name], &cancel()).unwrap();
            assert_eq!(outcome.rows_affected, 1);
        }
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn exec_on_select_discards_rows() {
        let db = people();
        let stmt = db.prepare("SELECT name FROM people", &cancel()).unwrap();
        let outcome = stmt.exec(&[], &cancel()).unwrap();
        assert_eq!(outcome.rows_affected, 0);
        assert_eq!(stmt.query(&[], &cancel()).unwrap().count(), 2);
    }

    #[test]
    fn exec_with_returning_counts_changes() {
        let db = people();
        let stmt = db
            .prepare("INSERT INTO people (name) VALUES (?1) RETURNING id", &cancel())
            .unwrap();
        let outcome = stmt.exec(&args!["cy"], &cancel()).unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.last_insert_id, Some(3));
    }

    #[test]
    fn closed_statement_is_rejected() {
        let db = people();
        let stmt = db.prepare("SELECT 1", &cancel()).unwrap();
        stmt.close().unwrap();
        assert!(stmt.is_closed());
        assert!(matches!(stmt.query(&[], &cancel()), Err(SqliteError::StatementClosed)));
    }

    #[test]
    fn cancelled_query_returns_cancelled() {
        let db = people();
        let stmt = db.prepare("SELECT * FROM people", &cancel()).unwrap();
        let token = cancel();
        token.cancel();
        assert!(matches!(stmt.query(&[], &token), Err(SqliteError::Cancelled)));
    }
}
