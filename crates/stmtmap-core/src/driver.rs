//! Capabilities the registry needs from a database driver.
//!
//! The registry never opens or configures a connection. It only prepares
//! statements against one, runs raw statements on it for [`Registry::batch`],
//! and closes it on [`Registry::close`].
//!
//! [`Registry::batch`]: crate::Registry::batch
//! [`Registry::close`]: crate::Registry::close

use tokio_util::sync::CancellationToken;

use crate::value::{ExecOutcome, Row, SingleRow, Value};

/// Boxed driver error carried as the source of registry errors.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An open database connection that can prepare statements.
pub trait Connection: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Statement: Statement<Error = Self::Error>;

    /// Compile `query` into a reusable statement handle.
    fn prepare(&self, query: &str, cancel: &CancellationToken)
        -> Result<Self::Statement, Self::Error>;

    /// Execute a raw statement directly, without preparing a handle.
    fn exec(
        &self,
        query: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, Self::Error>;

    fn close(&self) -> Result<(), Self::Error>;
}

/// A prepared statement bound to the connection that produced it.
pub trait Statement: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    /// Forward-only, one-pass cursor over result rows.
    type Rows: Iterator<Item = Result<Row, Self::Error>>;

    fn exec(&self, args: &[Value], cancel: &CancellationToken) -> Result<ExecOutcome, Self::Error>;

    fn query(&self, args: &[Value], cancel: &CancellationToken) -> Result<Self::Rows, Self::Error>;

    /// Fetch at most one row. Failures are stored in the returned
    /// [`SingleRow`] and reported when it is resolved.
    fn query_row(&self, args: &[Value], cancel: &CancellationToken) -> SingleRow {
        match self.query(args, cancel) {
            Ok(mut rows) => match rows.next() {
                Some(Ok(row)) => SingleRow::found(row),
                Some(Err(e)) => SingleRow::failed(e),
                None => SingleRow::empty(),
            },
            Err(e) => SingleRow::failed(e),
        }
    }

    fn close(&self) -> Result<(), Self::Error>;
}
