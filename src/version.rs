//! Bookkeeping of which migrations have been applied.
//!
//! The tracker owns a table inside the migrated database:
//!
//! | column   | type        |                      |
//! |----------|-------------|----------------------|
//! | `id`     | `TEXT`      | primary key          |
//! | `run_on` | `TIMESTAMP` | when `up` completed  |
//!
//! A row exists exactly while a migration is applied: it is inserted after a
//! successful `up` and deleted after a successful `down`.

use chrono::NaiveDateTime;

use crate::database::{Database, DatabaseError, DatabaseValue, Row};
use crate::error::{MigrationError, Result};
use crate::schema::{create_table, quote, Column, DataType};

/// Name of the tracking table unless configured otherwise.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "__schema_migrations";

/// Timestamps are written with six fractional digits; this also reads rows written by
/// other tools with fewer.
const RUN_ON_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct AppliedMigration {
    pub id: String,
    pub run_on: NaiveDateTime,
}

/// Reads and writes the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTracker {
    table_name: String,
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::with_table_name(DEFAULT_MIGRATIONS_TABLE)
    }

    pub fn with_table_name(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn quoted_table(&self, db: &dyn Database) -> String {
        quote(db.sql_dialect(), &self.table_name)
    }

    /// Create the tracking table if it does not exist yet. Idempotent.
    pub async fn ensure_table(&self, db: &dyn Database) -> Result<()> {
        let statement = create_table(&self.table_name)
            .if_not_exists()
            .column(Column::new("id", DataType::Text).primary_key())
            .column(Column::new("run_on", DataType::Timestamp).not_null());
        db.exec_raw(&statement.to_sql(db.sql_dialect())).await?;
        Ok(())
    }

    pub async fn is_applied(&self, db: &dyn Database, id: &str) -> Result<bool> {
        let rows = db
            .query(
                &format!("SELECT id FROM {} WHERE id = ?", self.quoted_table(db)),
                &[DatabaseValue::from(id)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Insert the row for `id`. Fails with [`MigrationError::AlreadyApplied`] if one
    /// exists.
    pub async fn record(&self, db: &dyn Database, id: &str, run_on: NaiveDateTime) -> Result<()> {
        if self.is_applied(db, id).await? {
            return Err(MigrationError::AlreadyApplied(id.to_string()));
        }
        db.exec_params(
            &format!(
                "INSERT INTO {} (id, run_on) VALUES (?, ?)",
                self.quoted_table(db)
            ),
            &[DatabaseValue::from(id), DatabaseValue::DateTime(run_on)],
        )
        .await?;
        Ok(())
    }

    /// Every applied migration, most recently applied first.
    pub async fn applied_list(&self, db: &dyn Database) -> Result<Vec<AppliedMigration>> {
        let rows = db
            .query(
                &format!(
                    "SELECT id, run_on FROM {} ORDER BY run_on DESC, id DESC",
                    self.quoted_table(db)
                ),
                &[],
            )
            .await?;
        rows.iter().map(applied_from_row).collect()
    }

    /// Delete the row for `id`. Fails with [`MigrationError::NotApplied`] if there was
    /// none.
    pub async fn remove(&self, db: &dyn Database, id: &str) -> Result<()> {
        let deleted = db
            .exec_params(
                &format!("DELETE FROM {} WHERE id = ?", self.quoted_table(db)),
                &[DatabaseValue::from(id)],
            )
            .await?;
        if deleted == 0 {
            return Err(MigrationError::NotApplied(id.to_string()));
        }
        Ok(())
    }
}

fn applied_from_row(row: &Row) -> Result<AppliedMigration> {
    let id = row.get_string("id")?;
    let run_on = match row.get("run_on") {
        Some(DatabaseValue::DateTime(dt)) => *dt,
        Some(DatabaseValue::String(s)) => NaiveDateTime::parse_from_str(s, RUN_ON_PARSE_FORMAT)
            .map_err(|e| DatabaseError::InvalidValue {
                column: "run_on".to_string(),
                message: format!("'{s}' is not a timestamp: {e}"),
            })?,
        other => {
            return Err(DatabaseError::InvalidValue {
                column: "run_on".to_string(),
                message: format!("expected timestamp, found {other:?}"),
            }
            .into())
        }
    };
    Ok(AppliedMigration { id, run_on })
}
