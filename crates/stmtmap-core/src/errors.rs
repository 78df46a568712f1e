//! Registry error types.

use thiserror::Error;

use crate::driver::DriverError;

/// Errors returned by [`Registry`](crate::Registry) operations and by row
/// resolution.
///
/// Variants that add registry context (which name or statement failed) keep
/// the driver's original error as their [`source`](std::error::Error::source).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No connection is configured, or the registry has been closed.
    #[error("database connection is not set")]
    InvalidConnection,

    #[error("statement with name \"{0}\" does not exist")]
    NotFound(String),

    #[error("statement with name \"{0}\" already exists")]
    DuplicateName(String),

    #[error("error adding mapping \"{name}\": {source}")]
    PrepareFailed {
        name: String,
        #[source]
        source: DriverError,
    },

    #[error("error executing batch statement \"{statement}\": {source}")]
    BatchStatementFailed {
        statement: String,
        #[source]
        source: DriverError,
    },

    #[error("error closing mapping \"{name}\": {source}")]
    CloseFailed {
        name: String,
        #[source]
        source: DriverError,
    },

    #[error("error closing database connection: {0}")]
    ConnectionCloseFailed(#[source] DriverError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no rows in result set")]
    NoRows,

    #[error("cannot scan column {column}: {detail}")]
    Scan { column: String, detail: String },

    /// An exec or query error from the statement itself, passed through as-is.
    #[error(transparent)]
    Driver(DriverError),
}

impl RegistryError {
    /// Box a driver error for the pass-through variant.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Driver(Box::new(err))
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
