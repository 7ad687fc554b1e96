use crate::database::DatabaseError;

/// Error type for the sqlshift crate.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    /// A migration source could not enumerate its migrations.
    #[error("migration discovery failed: {0}")]
    Discovery(String),
    /// An operation referenced a migration id that the source does not provide.
    #[error("migration '{0}' does not exist")]
    MigrationNotFound(String),
    /// A rollback candidate has no `down` operation.
    #[error("migration '{0}' has no down operation and cannot be rolled back")]
    NoDownOperation(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// The tracking table already holds a row for this id.
    #[error("migration '{0}' is already recorded as applied")]
    AlreadyApplied(String),
    /// The tracking table holds no row for this id.
    #[error("migration '{0}' is not recorded as applied")]
    NotApplied(String),
}

impl MigrationError {
    /// Whether this error rejects a request before any database work was done.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MigrationNotFound(_) | Self::NoDownOperation(_) | Self::Validation(_)
        )
    }

    /// Whether this error is a misuse of a transaction handle.
    pub fn is_transaction_state(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_transaction_state())
    }
}

impl From<String> for MigrationError {
    fn from(value: String) -> Self {
        Self::Validation(value)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for MigrationError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(value))
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
