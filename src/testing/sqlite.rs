use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::sqlite::RusqliteDatabase;
use crate::database::{Database, DatabaseValue, Row};
use crate::error::{MigrationError, Result};
use crate::migration::Migration;
use crate::runner::{ExecutionStrategy, MigrationRunner, RollbackStrategy};
use crate::version::DEFAULT_MIGRATIONS_TABLE;

/// A test harness for migration testing that provides state control and assertion helpers.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use sqlshift::sql_migration;
/// use sqlshift::testing::SqliteTestHarness;
///
/// sql_migration!(CreateUsers, "001_create_users", "Create users",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///     down: "DROP TABLE users"
/// );
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> sqlshift::Result<()> {
/// let harness = SqliteTestHarness::new(vec![Arc::new(CreateUsers)])?;
///
/// harness.migrate_to("001_create_users").await?;
/// harness.execute("INSERT INTO users VALUES (1, 'alice')").await?;
/// harness.assert_table_exists("users").await?;
///
/// assert_eq!(harness.query_i64("SELECT COUNT(*) FROM users").await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct SqliteTestHarness {
    db: RusqliteDatabase,
    migrations: Vec<Arc<dyn Migration>>,
    table_name: String,
}

/// Represents a captured database schema for comparison and snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Map of table name to table definitions
    pub tables: BTreeMap<String, TableSchema>,
}

/// Represents a table's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub sql: String,
}

fn assertion(message: String) -> MigrationError {
    MigrationError::Validation(message)
}

impl SqliteTestHarness {
    /// Create a harness over a fresh in-memory database.
    ///
    /// Pass the same migration list production uses: as it grows, assertions about
    /// earlier migrations should keep passing.
    pub fn new(migrations: Vec<Arc<dyn Migration>>) -> Result<Self> {
        Ok(Self::with_database(
            RusqliteDatabase::open_in_memory()?,
            migrations,
        ))
    }

    /// Create a harness over an existing database, for example a file database.
    pub fn with_database(db: RusqliteDatabase, migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self {
            db,
            migrations,
            table_name: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn database(&self) -> &RusqliteDatabase {
        &self.db
    }

    fn runner(&self) -> MigrationRunner {
        MigrationRunner::from_migrations(self.migrations.clone()).with_table_name(&self.table_name)
    }

    /// Apply or roll back until `target` is the most recent applied migration.
    ///
    /// Fails with [`MigrationError::MigrationNotFound`] if no migration has that id.
    pub async fn migrate_to(&self, target: &str) -> Result<()> {
        if !self.migrations.iter().any(|m| m.id() == target) {
            return Err(MigrationError::MigrationNotFound(target.to_string()));
        }

        let runner = self.runner();
        let applied = runner.applied_migrations(&self.db).await?;
        if applied.iter().any(|a| a.id == target) {
            runner
                .rollback(&self.db, RollbackStrategy::DownTo(target.to_string()))
                .await?;
        } else {
            runner
                .with_strategy(ExecutionStrategy::UpTo(target.to_string()))
                .run(&self.db)
                .await?;
        }
        Ok(())
    }

    /// Apply exactly one pending migration.
    pub async fn migrate_up_one(&self) -> Result<()> {
        let report = self
            .runner()
            .with_strategy(ExecutionStrategy::Steps(1))
            .run(&self.db)
            .await?;
        if report.applied.is_empty() {
            return Err(assertion("No pending migrations to apply".to_string()));
        }
        Ok(())
    }

    /// Roll back the most recently applied migration.
    pub async fn migrate_down_one(&self) -> Result<()> {
        let report = self
            .runner()
            .rollback(&self.db, RollbackStrategy::Last)
            .await?;
        if report.rolled_back.is_empty() {
            return Err(assertion("No applied migrations to roll back".to_string()));
        }
        Ok(())
    }

    /// Roll back everything.
    pub async fn reset(&self) -> Result<()> {
        self.runner()
            .rollback(&self.db, RollbackStrategy::All)
            .await?;
        Ok(())
    }

    /// Applied migration ids in ascending order.
    pub async fn applied_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .runner()
            .applied_migrations(&self.db)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Execute SQL (for setting up test data).
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.db.exec_raw(sql).await?;
        Ok(())
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        Ok(self.db.query(sql, &[]).await?)
    }

    /// Query a single integer: the first column of the first row.
    pub async fn query_i64(&self, sql: &str) -> Result<i64> {
        let rows = self.db.query(sql, &[]).await?;
        match rows.first().and_then(|r| r.columns.first()) {
            Some((_, DatabaseValue::Int64(value))) => Ok(*value),
            Some((column, other)) => Err(assertion(format!(
                "Expected an integer in column '{column}', found {other:?}"
            ))),
            None => Err(assertion(format!("Query returned no rows: {sql}"))),
        }
    }

    async fn count_in_master(&self, kind: &str, name: &str) -> Result<i64> {
        let rows = self
            .db
            .query(
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = ? AND name = ?",
                &[kind.into(), name.into()],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(row.get_i64("n")?),
            None => Ok(0),
        }
    }

    pub async fn assert_table_exists(&self, table_name: &str) -> Result<()> {
        if self.count_in_master("table", table_name).await? == 0 {
            return Err(assertion(format!("Table '{table_name}' does not exist")));
        }
        Ok(())
    }

    pub async fn assert_table_not_exists(&self, table_name: &str) -> Result<()> {
        if self.count_in_master("table", table_name).await? > 0 {
            return Err(assertion(format!(
                "Table '{table_name}' exists but should not"
            )));
        }
        Ok(())
    }

    pub async fn assert_column_exists(&self, table_name: &str, column_name: &str) -> Result<()> {
        let columns = self.get_columns(table_name).await?;
        if !columns.iter().any(|c| c.name == column_name) {
            return Err(assertion(format!(
                "Column '{column_name}' does not exist in table '{table_name}'"
            )));
        }
        Ok(())
    }

    pub async fn assert_index_exists(&self, index_name: &str) -> Result<()> {
        if self.count_in_master("index", index_name).await? == 0 {
            return Err(assertion(format!("Index '{index_name}' does not exist")));
        }
        Ok(())
    }

    /// Capture every user table except the tracking table.
    pub async fn capture_schema(&self) -> Result<SchemaSnapshot> {
        let rows = self
            .db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ? ORDER BY name",
                &[self.table_name.as_str().into()],
            )
            .await?;

        let mut tables = BTreeMap::new();
        for row in rows {
            let table_name = row.get_string("name")?;
            let columns = self.get_columns(&table_name).await?;
            let indexes = self.get_indexes(&table_name).await?;
            tables.insert(table_name, TableSchema { columns, indexes });
        }
        Ok(SchemaSnapshot { tables })
    }

    /// Assert that the current schema matches a previously captured snapshot, listing
    /// every difference on failure.
    pub async fn assert_schema_matches(&self, expected: &SchemaSnapshot) -> Result<()> {
        let actual = self.capture_schema().await?;
        if actual == *expected {
            return Ok(());
        }

        let mut differences = Vec::new();
        for table_name in expected.tables.keys() {
            if !actual.tables.contains_key(table_name) {
                differences.push(format!("  - Table '{table_name}' is missing"));
            }
        }
        for table_name in actual.tables.keys() {
            if !expected.tables.contains_key(table_name) {
                differences.push(format!("  - Unexpected table '{table_name}' found"));
            }
        }

        for (table_name, expected_table) in &expected.tables {
            let Some(actual_table) = actual.tables.get(table_name) else {
                continue;
            };

            if expected_table.columns != actual_table.columns {
                let expected_cols: Vec<_> =
                    expected_table.columns.iter().map(|c| &c.name).collect();
                let actual_cols: Vec<_> =
                    actual_table.columns.iter().map(|c| &c.name).collect();
                if expected_cols != actual_cols {
                    differences.push(format!(
                        "  - Table '{table_name}' column mismatch:\n    Expected columns: {expected_cols:?}\n    Actual columns:   {actual_cols:?}"
                    ));
                } else {
                    for (expected_col, actual_col) in
                        expected_table.columns.iter().zip(&actual_table.columns)
                    {
                        if expected_col != actual_col {
                            differences.push(format!(
                                "  - Table '{table_name}' column '{}' properties differ:\n    Expected: {expected_col:?}\n    Actual:   {actual_col:?}",
                                expected_col.name
                            ));
                        }
                    }
                }
            }

            if expected_table.indexes != actual_table.indexes {
                let expected_idxs: Vec<_> =
                    expected_table.indexes.iter().map(|i| &i.name).collect();
                let actual_idxs: Vec<_> =
                    actual_table.indexes.iter().map(|i| &i.name).collect();
                differences.push(format!(
                    "  - Table '{table_name}' index mismatch:\n    Expected indexes: {expected_idxs:?}\n    Actual indexes:   {actual_idxs:?}"
                ));
            }
        }

        Err(assertion(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    async fn get_columns(&self, table_name: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .db
            .query(
                &format!("PRAGMA table_info(\"{}\")", table_name.replace('"', "\"\"")),
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.get_string("name")?,
                    type_name: row.get_string("type")?,
                    not_null: row.get_i64("notnull")? != 0,
                    default_value: match row.get("dflt_value") {
                        Some(DatabaseValue::String(s)) => Some(s.clone()),
                        Some(DatabaseValue::Int64(i)) => Some(i.to_string()),
                        _ => None,
                    },
                    primary_key: row.get_i64("pk")? != 0,
                })
            })
            .collect()
    }

    async fn get_indexes(&self, table_name: &str) -> Result<Vec<IndexInfo>> {
        let rows = self
            .db
            .query(
                "SELECT name, sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL ORDER BY name",
                &[table_name.into()],
            )
            .await?;
        rows.iter()
            .map(|row| -> Result<IndexInfo> {
                let sql = row.get_string("sql")?;
                Ok(IndexInfo {
                    name: row.get_string("name")?,
                    unique: sql.to_uppercase().starts_with("CREATE UNIQUE"),
                    sql,
                })
            })
            .collect()
    }
}
