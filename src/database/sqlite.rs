//! # SQLite backend
//!
//! [`RusqliteDatabase`] implements [`Database`] on top of the
//! [`rusqlite`](https://crates.io/crates/rusqlite) crate, for both file-backed and
//! in-memory databases.
//!
//! ## Transaction isolation
//!
//! An in-memory SQLite database lives inside a single connection: opening a second
//! connection yields an empty database. File databases have no such restriction.
//! Both flavors still present the same isolation to callers:
//!
//! | | [`Serialized`](TransactionIsolation::Serialized) | [`DedicatedConnection`](TransactionIsolation::DedicatedConnection) |
//! |---|---|---|
//! | Used for | in-memory (always), files on request | files (default) |
//! | Transaction runs on | the shared connection | its own connection |
//! | Plain handle reads while a transaction is open | wait until commit/rollback | keep working, see last committed state |
//! | Plain handle writes while a transaction is open | wait until commit/rollback | wait until commit/rollback |
//! | Uncommitted writes visible outside | never | never |
//! | Concurrent transactions from one handle | one at a time | one at a time |
//!
//! Transactions are never finalized implicitly. Dropping an active
//! [`RusqliteTransaction`] logs an error; with a dedicated connection SQLite discards
//! the open transaction when that connection closes, while the shared connection is
//! left inside it and the next `BEGIN` on it fails.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use tokio::sync::{
    Mutex, MutexGuard, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, SemaphorePermit,
};

use super::{
    Database, DatabaseError, DatabaseTransaction, DatabaseValue, Row, SqlDialect,
    TransactionState, TIMESTAMP_FORMAT,
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// How a [`RusqliteDatabase`] isolates its transactions from the plain handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionIsolation {
    /// The transaction takes exclusive use of the shared connection.
    Serialized,
    /// The transaction opens its own connection to the database file.
    DedicatedConnection,
}

/// A cloneable handle to a SQLite database. Clones share the same connection.
#[derive(Clone)]
pub struct RusqliteDatabase {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    isolation: TransactionIsolation,
    busy_timeout: Duration,
    transaction_active: Arc<AtomicBool>,
    writer_permit: Arc<Semaphore>,
}

impl std::fmt::Debug for RusqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusqliteDatabase")
            .field("path", &self.path)
            .field("isolation", &self.isolation)
            .field("busy_timeout", &self.busy_timeout)
            .field(
                "transaction_active",
                &self.transaction_active.load(Ordering::Acquire),
            )
            .finish()
    }
}

fn is_memory_path(path: &Path) -> bool {
    let path = path.to_string_lossy();
    path.is_empty() || path == ":memory:" || path.contains("mode=memory")
}

impl RusqliteDatabase {
    fn from_connection(
        connection: Connection,
        path: Option<PathBuf>,
        isolation: TransactionIsolation,
    ) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
            isolation,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            transaction_active: Arc::new(AtomicBool::new(false)),
            writer_permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Open a private in-memory database. Transactions are always serialized.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let connection = Connection::open_in_memory()?;
        Ok(Self::from_connection(
            connection,
            None,
            TransactionIsolation::Serialized,
        ))
    }

    /// Open (or create) a database file.
    ///
    /// File databases switch to WAL journaling and give each transaction its own
    /// connection. Memory paths (`:memory:`, `mode=memory` URIs) fall back to
    /// [`TransactionIsolation::Serialized`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let connection = Connection::open(path)?;
        connection.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        if is_memory_path(path) {
            return Ok(Self::from_connection(
                connection,
                None,
                TransactionIsolation::Serialized,
            ));
        }

        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        Ok(Self::from_connection(
            connection,
            Some(path.to_path_buf()),
            TransactionIsolation::DedicatedConnection,
        ))
    }

    /// Choose the isolation model. Requests for dedicated connections on an
    /// in-memory database are ignored, since a second connection would not see it.
    pub fn with_isolation(mut self, isolation: TransactionIsolation) -> Self {
        if isolation == TransactionIsolation::DedicatedConnection && self.path.is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "In-memory databases cannot use dedicated transaction connections; keeping serialized isolation"
            );
            return self;
        }
        self.isolation = isolation;
        self
    }

    /// Set how long a statement waits on a locked database before failing.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Result<Self, DatabaseError> {
        {
            let connection = self.connection.try_lock().map_err(|_| {
                DatabaseError::Connection(
                    "cannot change busy timeout while the connection is in use".to_string(),
                )
            })?;
            connection.busy_timeout(timeout)?;
        }
        self.busy_timeout = timeout;
        Ok(self)
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a transaction begun from this handle has not been finalized yet.
    pub fn in_transaction(&self) -> bool {
        self.transaction_active.load(Ordering::Acquire)
    }

    async fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        if self.isolation == TransactionIsolation::Serialized && self.in_transaction() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Waiting for the active transaction to finish");
        }
        self.connection.lock().await
    }

    /// With dedicated connections, plain-handle writes hold the writer permit while
    /// they run, so they wait for an open transaction to finish.
    async fn acquire_writer(&self) -> Result<Option<SemaphorePermit<'_>>, DatabaseError> {
        if self.isolation != TransactionIsolation::DedicatedConnection {
            return Ok(None);
        }
        if self.in_transaction() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Waiting for the active transaction to finish before writing");
        }
        let permit = self
            .writer_permit
            .acquire()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Ok(Some(permit))
    }

    async fn open_dedicated(&self, path: &Path) -> Result<TransactionConnection, DatabaseError> {
        let permit = self
            .writer_permit
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let connection = Connection::open(path)?;
        connection.busy_timeout(self.busy_timeout)?;
        connection.execute_batch("BEGIN IMMEDIATE")?;
        Ok(TransactionConnection::Dedicated {
            connection,
            _permit: permit,
        })
    }

    async fn open_shared(&self) -> Result<TransactionConnection, DatabaseError> {
        if self.in_transaction() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Waiting for the active transaction to finish before starting another");
        }
        let guard = self.connection.clone().lock_owned().await;
        guard.execute_batch("BEGIN")?;
        Ok(TransactionConnection::Shared(guard))
    }
}

impl ToSql for DatabaseValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            DatabaseValue::Null => ToSqlOutput::Owned(Value::Null),
            DatabaseValue::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            DatabaseValue::Int64(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            DatabaseValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            DatabaseValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            DatabaseValue::DateTime(dt) => {
                ToSqlOutput::Owned(Value::Text(dt.format(TIMESTAMP_FORMAT).to_string()))
            }
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> DatabaseValue {
    match value {
        ValueRef::Null => DatabaseValue::Null,
        ValueRef::Integer(i) => DatabaseValue::Int64(i),
        ValueRef::Real(f) => DatabaseValue::Real(f),
        ValueRef::Text(t) => DatabaseValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => DatabaseValue::Bytes(b.to_vec()),
    }
}

fn execute_params(
    connection: &Connection,
    statement: &str,
    params: &[DatabaseValue],
) -> Result<u64, DatabaseError> {
    let affected = connection.execute(statement, params_from_iter(params.iter()))?;
    Ok(affected as u64)
}

fn query_rows(
    connection: &Connection,
    query: &str,
    params: &[DatabaseValue],
) -> Result<Vec<Row>, DatabaseError> {
    let mut statement = connection.prepare(query)?;
    let names: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = statement.query(params_from_iter(params.iter()))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            columns.push((name.clone(), from_value_ref(row.get_ref(index)?)));
        }
        results.push(Row { columns });
    }
    Ok(results)
}

#[async_trait]
impl Database for RusqliteDatabase {
    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        let _writer = self.acquire_writer().await?;
        let connection = self.lock_connection().await;
        connection.execute_batch(statement)?;
        Ok(())
    }

    async fn exec_params(
        &self,
        statement: &str,
        params: &[DatabaseValue],
    ) -> Result<u64, DatabaseError> {
        let _writer = self.acquire_writer().await?;
        let connection = self.lock_connection().await;
        execute_params(&connection, statement, params)
    }

    async fn query(
        &self,
        query: &str,
        params: &[DatabaseValue],
    ) -> Result<Vec<Row>, DatabaseError> {
        let connection = self.lock_connection().await;
        query_rows(&connection, query, params)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        let connection = match (self.isolation, self.path.as_deref()) {
            (TransactionIsolation::DedicatedConnection, Some(path)) => {
                self.open_dedicated(path).await?
            }
            _ => self.open_shared().await?,
        };

        self.transaction_active.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::trace!(isolation = ?self.isolation, "Transaction started");

        Ok(Box::new(RusqliteTransaction {
            inner: std::sync::Mutex::new(TransactionInner {
                connection: Some(connection),
                state: TransactionState::Active,
            }),
            transaction_active: Arc::clone(&self.transaction_active),
        }))
    }
}

enum TransactionConnection {
    /// Exclusive use of the handle's shared connection.
    Shared(OwnedMutexGuard<Connection>),
    Dedicated {
        connection: Connection,
        _permit: OwnedSemaphorePermit,
    },
}

impl std::ops::Deref for TransactionConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Self::Shared(guard) => guard,
            Self::Dedicated { connection, .. } => connection,
        }
    }
}

struct TransactionInner {
    connection: Option<TransactionConnection>,
    state: TransactionState,
}

/// A transaction opened by [`RusqliteDatabase::begin_transaction`].
pub struct RusqliteTransaction {
    inner: std::sync::Mutex<TransactionInner>,
    transaction_active: Arc<AtomicBool>,
}

impl std::fmt::Debug for RusqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusqliteTransaction")
            .field("state", &self.state())
            .finish()
    }
}

impl RusqliteTransaction {
    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, TransactionInner>, DatabaseError> {
        self.inner
            .lock()
            .map_err(|_| DatabaseError::Connection("transaction lock poisoned".to_string()))
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let inner = self.lock_inner()?;
        match (&inner.state, inner.connection.as_ref()) {
            (TransactionState::Active, Some(connection)) => f(connection),
            (state, _) => Err(DatabaseError::TransactionFinished(*state)),
        }
    }

    fn finish(&self, statement: &str, terminal: TransactionState) -> Result<(), DatabaseError> {
        let mut inner = self.lock_inner()?;
        if inner.state != TransactionState::Active {
            return Err(DatabaseError::TransactionFinished(inner.state));
        }
        if let Some(connection) = inner.connection.as_ref() {
            connection.execute_batch(statement)?;
        }
        inner.state = terminal;
        // Releases the shared connection or closes the dedicated one.
        inner.connection = None;
        self.transaction_active.store(false, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::trace!(state = %terminal, "Transaction finished");

        Ok(())
    }
}

#[async_trait]
impl Database for RusqliteTransaction {
    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        self.with_connection(|connection| {
            connection.execute_batch(statement)?;
            Ok(())
        })
    }

    async fn exec_params(
        &self,
        statement: &str,
        params: &[DatabaseValue],
    ) -> Result<u64, DatabaseError> {
        self.with_connection(|connection| execute_params(connection, statement, params))
    }

    async fn query(
        &self,
        query: &str,
        params: &[DatabaseValue],
    ) -> Result<Vec<Row>, DatabaseError> {
        self.with_connection(|connection| query_rows(connection, query, params))
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        match self.state() {
            TransactionState::Active => Err(DatabaseError::AlreadyInTransaction),
            state => Err(DatabaseError::TransactionFinished(state)),
        }
    }
}

#[async_trait]
impl DatabaseTransaction for RusqliteTransaction {
    async fn commit(&self) -> Result<(), DatabaseError> {
        self.finish("COMMIT", TransactionState::Committed)
    }

    async fn rollback(&self) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK", TransactionState::RolledBack)
    }

    fn state(&self) -> TransactionState {
        match self.inner.lock() {
            Ok(inner) => inner.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }
}

impl Drop for RusqliteTransaction {
    fn drop(&mut self) {
        if self.state() == TransactionState::Active {
            #[cfg(feature = "tracing")]
            tracing::error!(
                "Transaction dropped while still active; call commit() or rollback() explicitly"
            );
            self.transaction_active.store(false, Ordering::Release);
        }
    }
}
