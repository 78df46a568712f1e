use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use stmtmap_core::{args, RegistryError, RegistryState, Row, Statement};
use stmtmap_sqlite::{SqliteConnection, SqliteError, SqliteRegistry};
use tokio_util::sync::CancellationToken;

const CREATE_TESTING: &str = "CREATE TABLE IF NOT EXISTS Testing1 (
    TestID INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    TestName VARCHAR(64) NOT NULL UNIQUE
)";

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn registry() -> (SqliteRegistry, SqliteConnection) {
    let conn = SqliteConnection::in_memory().unwrap();
    (SqliteRegistry::new(conn.clone()), conn)
}

fn table_exists(conn: &SqliteConnection, name: &str) -> bool {
    conn.with_conn(|c| {
        let n: i64 = c.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    })
    .unwrap()
}

#[test]
fn create_insert_select_flow() {
    let (reg, _) = registry();
    reg.add("create_table", CREATE_TESTING).unwrap();
    reg.exec("create_table", &[]).unwrap();

    reg.extend(
        BTreeMap::from([
            ("insert", "INSERT INTO Testing1(TestName) VALUES(?)"),
            ("select", "SELECT TestName FROM Testing1 WHERE TestID = ?"),
        ]),
    )
    .unwrap();
    assert_eq!(reg.len(), 3);

    let outcome = reg.exec("insert", &args!["Hello World :D!"]).unwrap();
    assert_eq!(outcome.rows_affected, 1);
    assert_eq!(outcome.last_insert_id, Some(1));

    let mut rows = reg.query("select", &args![1]).unwrap();
    let first = rows.next().unwrap().unwrap();
    assert_eq!(first.get::<String>(0).unwrap(), "Hello World :D!");
    assert!(rows.next().is_none());

    reg.close().unwrap();
    assert_eq!(reg.state(), RegistryState::Closed);
}

#[test]
fn duplicate_add_keeps_first_statement() {
    let (reg, _) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let err = reg.add("q", "SELECT 2").unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateName(_)));
    let value: i64 = reg.query_row("q", &[]).unwrap().scan(0).unwrap();
    assert_eq!(value, 1);
}

#[test]
fn invalid_sql_fails_at_prepare() {
    let (reg, _) = registry();
    let err = reg.add("bad", "SELEC 1").unwrap_err();
    match &err {
        RegistryError::PrepareFailed { name, source } => {
            assert_eq!(name, "bad");
            assert!(source.downcast_ref::<SqliteError>().is_some());
        }
        other => panic!("unexpected: {other}"),
    }
    assert!(reg.is_empty());
}

#[test]
fn extend_partial_failure_keeps_earlier_entries() {
    let (reg, _) = registry();
    let err = reg
        .extend(
            vec![
                ("a", "SELECT 1"),
                ("b", "SELECT * FROM no_such_table"),
                ("c", "SELECT 3"),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::PrepareFailed { ref name, .. } if name == "b"));
    assert!(reg.contains("a"));
    assert!(!reg.contains("b"));
    assert!(!reg.contains("c"));
    assert_eq!(reg.len(), 1);
}

#[test]
fn batch_stops_at_failing_statement() {
    let (reg, conn) = registry();
    let err = reg
        .batch(
            [
                "CREATE TABLE first (x INTEGER)",
                "INSERT INTO missing VALUES (1)",
                "CREATE TABLE second (x INTEGER)",
            ],
        )
        .unwrap_err();
    match &err {
        RegistryError::BatchStatementFailed { statement, .. } => {
            assert_eq!(statement, "INSERT INTO missing VALUES (1)");
        }
        other => panic!("unexpected: {other}"),
    }
    assert!(err.to_string().contains("INSERT INTO missing"));
    assert!(table_exists(&conn, "first"));
    assert!(!table_exists(&conn, "second"));
}

#[test]
fn batch_then_register_dependent_statements() {
    let (reg, _) = registry();
    reg.batch(
        [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE INDEX idx_users_name ON users(name)",
        ],
    )
    .unwrap();
    reg.extend(
        vec![
            ("insert_user", "INSERT INTO users (name) VALUES (?1)"),
            ("all_users", "SELECT id, name FROM users ORDER BY id"),
        ],
    )
    .unwrap();
    for name in ["ada", "bob", "cy"] {
        reg.exec("insert_user", &args![name]).unwrap();
    }
    let rows: Vec<Row> = reg
        .query("all_users", &[])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let names: Vec<String> = rows.iter().map(|r| r.get_named("name").unwrap()).collect();
    assert_eq!(names, ["ada", "bob", "cy"]);
}

#[test]
fn query_row_missing_row_resolves_to_no_rows() {
    let (reg, _) = registry();
    reg.batch(["CREATE TABLE t (x INTEGER)"]).unwrap();
    reg.add("by_x", "SELECT x FROM t WHERE x = ?1").unwrap();
    let pending = reg.query_row("by_x", &args![42]).expect("registered");
    assert!(matches!(pending.row(), Err(RegistryError::NoRows)));
    assert!(reg.query_row("nope", &[]).is_none());
}

#[test]
fn exec_error_is_passed_through() {
    let (reg, _) = registry();
    reg.batch(["CREATE TABLE u (name TEXT UNIQUE)"]).unwrap();
    reg.add("insert", "INSERT INTO u (name) VALUES (?1)").unwrap();
    reg.exec("insert", &args!["x"]).unwrap();
    let err = reg.exec("insert", &args!["x"]).unwrap_err();
    match err {
        RegistryError::Driver(source) => {
            let sqlite = source.downcast_ref::<SqliteError>().expect("sqlite error");
            assert_eq!(
                sqlite.sqlite_code(),
                Some(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
            );
        }
        other => panic!("unexpected: {other}"),
    }
}

#[test]
fn get_returns_usable_handle() {
    let (reg, _) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let handle = reg.get("q").expect("found");
    assert_eq!(handle.sql(), "SELECT 1");
    let value: i64 = handle.query_row(&[], &cancel()).scan(0).unwrap();
    assert_eq!(value, 1);
}

#[test]
fn select_handle_supports_exec_and_query() {
    let (reg, _) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let outcome = reg.exec("q", &[]).unwrap();
    assert_eq!(outcome.rows_affected, 0);
    let value: i64 = reg.query_row("q", &[]).unwrap().scan(0).unwrap();
    assert_eq!(value, 1);
}

#[test]
fn batch_accepts_pragmas_and_scripts() {
    let (reg, conn) = registry();
    reg.batch([
        "PRAGMA journal_mode = WAL",
        "CREATE TABLE a (x INTEGER); CREATE TABLE b (x INTEGER);",
        "SELECT COUNT(*) FROM a",
    ])
    .unwrap();
    assert!(table_exists(&conn, "a"));
    assert!(table_exists(&conn, "b"));
}

#[test]
fn cancelled_token_reaches_driver() {
    let (reg, _) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let token = cancel();
    token.cancel();
    match reg.query_with_cancel("q", &[], &token) {
        Err(RegistryError::Driver(source)) => {
            assert!(matches!(
                source.downcast_ref::<SqliteError>(),
                Some(SqliteError::Cancelled)
            ));
        }
        Err(other) => panic!("unexpected: {other}"),
        Ok(_) => panic!("query ran with a cancelled token"),
    }
    assert!(matches!(
        reg.batch_with_cancel(["CREATE TABLE t (x)"], &token),
        Err(RegistryError::Cancelled)
    ));
}

#[test]
fn remove_closes_handle() {
    let (reg, _) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let handle = reg.get("q").unwrap();
    assert!(reg.remove("q"));
    assert!(!reg.remove("q"));
    assert!(handle.is_closed());
    assert!(matches!(
        reg.exec("q", &[]),
        Err(RegistryError::NotFound(_))
    ));
}

#[test]
fn close_closes_connection() {
    let (reg, conn) = registry();
    reg.add("q", "SELECT 1").unwrap();
    let handle = reg.get("q").unwrap();
    reg.close().unwrap();
    assert!(conn.is_closed());
    assert!(handle.is_closed());
    assert!(reg.is_empty());
    assert!(matches!(
        reg.add("q", "SELECT 1"),
        Err(RegistryError::InvalidConnection)
    ));
}

#[test]
fn file_database_persists_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");

    let reg = SqliteRegistry::new(SqliteConnection::open(&path).unwrap());
    reg.batch(["CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)"])
        .unwrap();
    reg.add("put", "INSERT INTO kv (k, v) VALUES (?1, ?2)")
        .unwrap();
    reg.exec("put", &args!["greeting", "hi"]).unwrap();
    reg.close().unwrap();

    let reg = SqliteRegistry::new(SqliteConnection::open(&path).unwrap());
    reg.add("get", "SELECT v FROM kv WHERE k = ?1").unwrap();
    let v: String = reg
        .query_row("get", &args!["greeting"])
        .unwrap()
        .scan(0)
        .unwrap();
    assert_eq!(v, "hi");
    reg.close().unwrap();
}

#[test]
fn concurrent_adds_register_once() {
    let (reg, _) = registry();
    let ok = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| match reg.add("shared", "SELECT 1") {
                Ok(()) => {
                    ok.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => assert!(matches!(e, RegistryError::DuplicateName(_))),
            });
        }
    });
    assert_eq!(ok.load(Ordering::SeqCst), 1);
    assert_eq!(reg.len(), 1);
}

#[test]
fn concurrent_inserts_through_one_statement() {
    let (reg, _) = registry();
    reg.batch(["CREATE TABLE hits (worker INTEGER)"]).unwrap();
    reg.extend(
        vec![
            ("hit", "INSERT INTO hits (worker) VALUES (?1)"),
            ("count", "SELECT COUNT(*) FROM hits"),
        ],
    )
    .unwrap();
    std::thread::scope(|s| {
        for worker in 0..4_i64 {
            let reg = &reg;
            s.spawn(move || {
                for _ in 0..25 {
                    reg.exec("hit", &args![worker]).unwrap();
                }
            });
        }
    });
    let total: i64 = reg.query_row("count", &[]).unwrap().scan(0).unwrap();
    assert_eq!(total, 100);
}
