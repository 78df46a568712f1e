//! # stmtmap-core
//!
//! A thread-safe registry of named prepared statements.
//!
//! Prepare a statement once under a name, then execute or query it by that
//! name from any thread. The registry also runs ordered batches of raw
//! statements (schema setup, migrations) and tears everything down, the
//! connection included, with [`Registry::close`].
//!
//! Every operation that reaches the database has a `*_with_cancel` form
//! taking a [`CancellationToken`](tokio_util::sync::CancellationToken);
//! the plain form runs with a token that never fires.
//!
//! The registry is driver-agnostic: it works over any type implementing
//! [`driver::Connection`].
//!
//! ```
//! use stmtmap_core::mock::MockConnection;
//! use stmtmap_core::{args, Registry};
//!
//! let registry = Registry::new(MockConnection::new());
//! registry.add("insert", "INSERT INTO t(name) VALUES(?)").unwrap();
//! let outcome = registry.exec("insert", &args!["hello"]).unwrap();
//! assert_eq!(outcome.rows_affected, 1);
//! registry.close().unwrap();
//! ```

pub mod driver;
pub mod errors;
pub mod mock;
pub mod registry;
pub mod value;

pub use driver::{Connection, DriverError, Statement};
pub use errors::{RegistryError, Result};
pub use registry::{Handle, Registry, RegistryState, RowsOf};
pub use value::{ExecOutcome, FromValue, Row, SingleRow, Value};
