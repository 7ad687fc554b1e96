//! The database capability consumed by the migration engine.
//!
//! The engine never talks to a driver directly. Everything it needs, from running a
//! migration's SQL to scanning the tracking table, goes through [`Database`]. A
//! [`DatabaseTransaction`] exposes the same capability, so a migration is written once
//! and can run either directly against a handle or inside a transaction.
//!
//! ## Transactions
//!
//! Transactions are finalized explicitly. Dropping an active transaction does not
//! commit or roll it back; backends log the mistake instead. Using a transaction
//! after [`commit`](DatabaseTransaction::commit) or
//! [`rollback`](DatabaseTransaction::rollback) fails with
//! [`DatabaseError::TransactionFinished`], and beginning a transaction on a
//! transaction fails with [`DatabaseError::AlreadyInTransaction`].

use async_trait::async_trait;
use chrono::NaiveDateTime;

pub mod executable;
pub use executable::Executable;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

/// Text layout used when a [`DatabaseValue::DateTime`] is stored as text.
/// Fixed-width so that lexical and chronological order agree.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// SQL flavor spoken by a database, used by the schema builder to render DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    MySql,
}

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Errors surfaced by a [`Database`] or [`DatabaseTransaction`].
#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `begin_transaction` was called on a handle that is itself an active transaction.
    #[error("a transaction is already active on this handle; nested transactions are not supported")]
    AlreadyInTransaction,
    /// The transaction has already been committed or rolled back.
    #[error("transaction already {0}")]
    TransactionFinished(TransactionState),
    #[error("invalid value in column '{column}': {message}")]
    InvalidValue { column: String, message: String },
    #[error("connection error: {0}")]
    Connection(String),
}

impl DatabaseError {
    pub fn is_transaction_state(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInTransaction | Self::TransactionFinished(_)
        )
    }
}

/// A value bound as a statement parameter or read back from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    String(String),
    Int64(i64),
    Real(f64),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl DatabaseValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A row returned by [`Database::query`], columns kept in select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<(String, DatabaseValue)>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Read a text column, failing if it is missing or not text.
    pub fn get_string(&self, column: &str) -> Result<String, DatabaseError> {
        match self.get(column) {
            Some(DatabaseValue::String(s)) => Ok(s.clone()),
            Some(other) => Err(DatabaseError::InvalidValue {
                column: column.to_string(),
                message: format!("expected text, found {other:?}"),
            }),
            None => Err(DatabaseError::InvalidValue {
                column: column.to_string(),
                message: "column not present in row".to_string(),
            }),
        }
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, DatabaseError> {
        match self.get(column) {
            Some(DatabaseValue::Int64(i)) => Ok(*i),
            Some(other) => Err(DatabaseError::InvalidValue {
                column: column.to_string(),
                message: format!("expected integer, found {other:?}"),
            }),
            None => Err(DatabaseError::InvalidValue {
                column: column.to_string(),
                message: "column not present in row".to_string(),
            }),
        }
    }
}

/// Statement execution, querying and transactions against one database.
#[async_trait]
pub trait Database: Send + Sync {
    fn sql_dialect(&self) -> SqlDialect;

    /// Execute one or more statements with no parameters.
    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError>;

    /// Execute a single parameterized statement, returning the number of affected rows.
    async fn exec_params(
        &self,
        statement: &str,
        params: &[DatabaseValue],
    ) -> Result<u64, DatabaseError>;

    /// Run a query and collect every row.
    async fn query(&self, query: &str, params: &[DatabaseValue])
        -> Result<Vec<Row>, DatabaseError>;

    /// Open a transaction. The returned handle must be finalized with
    /// [`commit`](DatabaseTransaction::commit) or [`rollback`](DatabaseTransaction::rollback).
    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError>;
}

/// An in-flight unit of work. Exposes the full [`Database`] capability.
#[async_trait]
pub trait DatabaseTransaction: Database {
    async fn commit(&self) -> Result<(), DatabaseError>;

    async fn rollback(&self) -> Result<(), DatabaseError>;

    fn state(&self) -> TransactionState;
}

// Lets `&tx` stand in wherever a `&dyn Database` is expected.
#[async_trait]
impl Database for Box<dyn DatabaseTransaction> {
    fn sql_dialect(&self) -> SqlDialect {
        (**self).sql_dialect()
    }

    async fn exec_raw(&self, statement: &str) -> Result<(), DatabaseError> {
        (**self).exec_raw(statement).await
    }

    async fn exec_params(
        &self,
        statement: &str,
        params: &[DatabaseValue],
    ) -> Result<u64, DatabaseError> {
        (**self).exec_params(statement, params).await
    }

    async fn query(
        &self,
        query: &str,
        params: &[DatabaseValue],
    ) -> Result<Vec<Row>, DatabaseError> {
        (**self).query(query, params).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn DatabaseTransaction>, DatabaseError> {
        (**self).begin_transaction().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup_by_column_name() {
        let row = Row {
            columns: vec![
                ("id".to_string(), DatabaseValue::from("001_init")),
                ("count".to_string(), DatabaseValue::Int64(3)),
            ],
        };
        assert_eq!(row.get_string("id").unwrap(), "001_init");
        assert_eq!(row.get_i64("count").unwrap(), 3);
        assert!(row.get("missing").is_none());
        assert!(matches!(
            row.get_i64("id"),
            Err(DatabaseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn transaction_state_display() {
        assert_eq!(
            DatabaseError::TransactionFinished(TransactionState::RolledBack).to_string(),
            "transaction already rolled back"
        );
    }
}
