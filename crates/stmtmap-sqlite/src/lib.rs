//! SQLite driver for the statement registry, built on `rusqlite` with
//! bundled SQLite.
//!
//! ```
//! use stmtmap_core::args;
//! use stmtmap_sqlite::{SqliteConnection, SqliteRegistry};
//!
//! let registry = SqliteRegistry::new(SqliteConnection::in_memory().unwrap());
//! registry.batch(["CREATE TABLE t (name TEXT)"]).unwrap();
//! registry.add("insert", "INSERT INTO t (name) VALUES (?1)").unwrap();
//! registry.exec("insert", &args!["hello"]).unwrap();
//! registry.close().unwrap();
//! ```

pub mod connection;
pub mod error;
pub mod statement;

pub use connection::{SqliteConfig, SqliteConnection};
pub use error::SqliteError;
pub use statement::{SqliteRows, SqliteStatement};

/// A registry of statements prepared on one SQLite connection.
pub type SqliteRegistry = stmtmap_core::Registry<SqliteConnection>;
