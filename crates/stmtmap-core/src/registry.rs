use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::driver::{Connection, Statement};
use crate::errors::{RegistryError, Result};
use crate::value::{ExecOutcome, SingleRow, Value};

/// Shared handle to a statement prepared by connection `C`.
pub type Handle<C> = Arc<<C as Connection>::Statement>;

/// Rows cursor produced by statements of connection `C`.
pub type RowsOf<C> = <<C as Connection>::Statement as Statement>::Rows;

/// Lifecycle of a registry as driven by [`Registry::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryState {
    Open,
    /// A statement or the connection failed to close. Calling `close`
    /// again resumes with whatever is left.
    PartiallyClosed,
    /// Every statement and the connection are closed. Terminal.
    Closed,
}

struct Inner<C: Connection> {
    connection: Option<C>,
    /// Allocated on first insert; `None` reads as empty.
    entries: Option<HashMap<String, Handle<C>>>,
    state: RegistryState,
}

impl<C: Connection> Inner<C> {
    fn connection(&self) -> Result<&C> {
        self.connection
            .as_ref()
            .ok_or(RegistryError::InvalidConnection)
    }

    fn contains(&self, name: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.contains_key(name))
    }

    fn lookup(&self, name: &str) -> Option<Handle<C>> {
        self.entries.as_ref()?.get(name).cloned()
    }

    fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, HashMap::len)
    }

    /// Duplicate check, prepare, insert. Caller holds the write lock.
    fn prepare_and_insert(
        &mut self,
        name: String,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.contains(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        let statement = self
            .connection()?
            .prepare(query, cancel)
            .map_err(|e| RegistryError::PrepareFailed {
                name: name.clone(),
                source: Box::new(e),
            })?;
        debug!(name = %name, "statement registered");
        self.entries
            .get_or_insert_with(HashMap::new)
            .insert(name, Arc::new(statement));
        Ok(())
    }
}

/// Named prepared statements over one database connection.
///
/// Safe to share between threads. A single reader/writer lock covers the
/// whole registry: lookups share it, while `add`, `extend`, `remove`,
/// `batch` and `close` hold it exclusively for their entire run, database
/// round trips included. `exec`, `query` and `query_row` hold it only for
/// the name lookup.
pub struct Registry<C: Connection> {
    inner: RwLock<Inner<C>>,
}

impl<C: Connection> Default for Registry<C> {
    /// A registry with no connection. Every operation that needs one fails
    /// with [`RegistryError::InvalidConnection`].
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                connection: None,
                entries: None,
                state: RegistryState::Open,
            }),
        }
    }
}

impl<C: Connection> Registry<C> {
    pub fn new(connection: C) -> Self {
        let registry = Self::default();
        registry.inner.write().connection = Some(connection);
        registry
    }

    pub fn state(&self) -> RegistryState {
        self.inner.read().state
    }

    /// Number of registered names. Approximate while other threads mutate.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains(name)
    }

    /// The raw handle registered under `name`, without executing anything.
    pub fn get(&self, name: &str) -> Option<Handle<C>> {
        self.inner.read().lookup(name)
    }

    /// Prepare `query` and register it as `name`.
    ///
    /// Fails with `DuplicateName` before preparing anything if `name` is
    /// taken. A failed prepare leaves the registry unchanged.
    pub fn add(&self, name: &str, query: &str) -> Result<()> {
        self.add_with_cancel(name, query, &CancellationToken::new())
    }

    /// [`add`](Self::add), aborted with `cancel`.
    #[instrument(skip(self, query, cancel))]
    pub fn add_with_cancel(&self, name: &str, query: &str, cancel: &CancellationToken) -> Result<()> {
        let mut inner = self.inner.write();
        inner.connection()?;
        inner.prepare_and_insert(name.to_string(), query, cancel)
    }

    /// Prepare and register every `(name, query)` pair, in iteration order,
    /// under one write lock.
    ///
    /// Not transactional: stops at the first duplicate, prepare failure or
    /// cancellation, and keeps the pairs registered before it. A name that
    /// repeats inside `queries` counts as a duplicate.
    pub fn extend<I, K, Q>(&self, queries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Q)>,
        K: Into<String>,
        Q: AsRef<str>,
    {
        self.extend_with_cancel(queries, &CancellationToken::new())
    }

    /// [`extend`](Self::extend), checking `cancel` before each pair.
    #[instrument(skip_all)]
    pub fn extend_with_cancel<I, K, Q>(&self, queries: I, cancel: &CancellationToken) -> Result<()>
    where
        I: IntoIterator<Item = (K, Q)>,
        K: Into<String>,
        Q: AsRef<str>,
    {
        let mut inner = self.inner.write();
        inner.connection()?;
        for (name, query) in queries {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            inner.prepare_and_insert(name.into(), query.as_ref(), cancel)?;
        }
        Ok(())
    }

    /// Close and unregister `name`. Returns false if it was not registered.
    /// Errors from closing the handle are ignored.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(entries) = inner.entries.as_mut() else {
            return false;
        };
        let Some(statement) = entries.get(name) else {
            return false;
        };
        let _ = statement.close();
        entries.remove(name);
        debug!(name, "statement removed");
        true
    }

    fn handle(&self, name: &str) -> Result<Handle<C>> {
        let inner = self.inner.read();
        inner.connection()?;
        inner
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Execute the statement registered as `name`. Driver errors are
    /// returned as [`RegistryError::Driver`] without extra context.
    pub fn exec(&self, name: &str, args: &[Value]) -> Result<ExecOutcome> {
        self.exec_with_cancel(name, args, &CancellationToken::new())
    }

    pub fn exec_with_cancel(&self, name: &str, args: &[Value], cancel: &CancellationToken) -> Result<ExecOutcome> {
        self.handle(name)?
            .exec(args, cancel)
            .map_err(RegistryError::driver)
    }

    /// Run the statement registered as `name` and return its row cursor.
    pub fn query(&self, name: &str, args: &[Value]) -> Result<RowsOf<C>> {
        self.query_with_cancel(name, args, &CancellationToken::new())
    }

    pub fn query_with_cancel(&self, name: &str, args: &[Value], cancel: &CancellationToken) -> Result<RowsOf<C>> {
        self.handle(name)?
            .query(args, cancel)
            .map_err(RegistryError::driver)
    }

    /// Fetch at most one row from the statement registered as `name`.
    ///
    /// `None` when there is no connection or no such statement. `Some` is
    /// always safe to resolve; fetch errors show up only when the
    /// [`SingleRow`] is resolved.
    pub fn query_row(&self, name: &str, args: &[Value]) -> Option<SingleRow> {
        self.query_row_with_cancel(name, args, &CancellationToken::new())
    }

    pub fn query_row_with_cancel(
        &self,
        name: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Option<SingleRow> {
        let statement = self.handle(name).ok()?;
        Some(statement.query_row(args, cancel))
    }

    /// Execute raw statements on the connection, in order, discarding any
    /// results.
    ///
    /// Stops at the first failure or cancellation. Statements that already
    /// ran are not rolled back.
    pub fn batch<I>(&self, queries: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.batch_with_cancel(queries, &CancellationToken::new())
    }

    /// [`batch`](Self::batch), checking `cancel` before each statement.
    #[instrument(skip_all)]
    pub fn batch_with_cancel<I>(&self, queries: I, cancel: &CancellationToken) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut queries = queries.into_iter().peekable();
        if queries.peek().is_none() {
            return Ok(());
        }
        let inner = self.inner.write();
        let connection = inner.connection()?;
        for (index, query) in queries.enumerate() {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            let query = query.as_ref();
            connection
                .exec(query, &[], cancel)
                .map_err(|e| RegistryError::BatchStatementFailed {
                    statement: query.to_string(),
                    source: Box::new(e),
                })?;
            debug!(index, "batch statement executed");
        }
        Ok(())
    }

    /// Close every statement (in name order), then the connection.
    ///
    /// Bails on the first failure. Statements closed before it are already
    /// unregistered, so calling `close` again retries only what is left.
    /// Closing a closed registry is a no-op.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.state == RegistryState::Closed {
            return Ok(());
        }

        if let Some(entries) = inner.entries.as_mut() {
            let mut names: Vec<String> = entries.keys().cloned().collect();
            names.sort_unstable();
            for name in names {
                if let Some(statement) = entries.get(&name) {
                    if let Err(e) = statement.close() {
                        inner.state = RegistryState::PartiallyClosed;
                        return Err(RegistryError::CloseFailed {
                            name,
                            source: Box::new(e),
                        });
                    }
                }
                entries.remove(&name);
            }
        }

        let Some(connection) = inner.connection.as_ref() else {
            return Err(RegistryError::InvalidConnection);
        };
        if let Err(e) = connection.close() {
            inner.state = RegistryState::PartiallyClosed;
            return Err(RegistryError::ConnectionCloseFailed(Box::new(e)));
        }
        inner.connection = None;
        inner.entries = None;
        inner.state = RegistryState::Closed;
        info!("registry closed");
        Ok(())
    }
}

impl<C: Connection> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("entries", &inner.len())
            .field("connected", &inner.connection.is_some())
            .field("state", &inner.state)
            .finish()
    }
}
