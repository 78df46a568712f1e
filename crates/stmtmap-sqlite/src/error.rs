#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection is closed")]
    ConnectionClosed,

    #[error("statement is closed")]
    StatementClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl SqliteError {
    /// SQLite extended result code, when the error came from SQLite itself.
    pub fn sqlite_code(&self) -> Option<i32> {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => Some(err.extended_code),
            _ => None,
        }
    }
}
