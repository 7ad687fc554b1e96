use std::collections::BTreeMap;
use std::sync::Arc;

use crate::database::{Database, Executable};
use crate::error::{MigrationError, Result};
use crate::migration::Migration;
use crate::runner::{ExecutionStrategy, MigrationRunner, RollbackStrategy};
use crate::version::DEFAULT_MIGRATIONS_TABLE;

/// Walks a migration list one migration at a time, seeding data around chosen
/// migrations, then rolls everything back.
///
/// Useful for checking that a migration copes with the data that exists when it runs
/// in production, not just with an empty table.
///
/// ```
/// use std::sync::Arc;
/// use sqlshift::database::sqlite::RusqliteDatabase;
/// use sqlshift::migration::{Migration, SqlMigration};
/// use sqlshift::testing::MigrationTestBuilder;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> sqlshift::Result<()> {
/// let migrations: Vec<Arc<dyn Migration>> = vec![
///     Arc::new(SqlMigration::new(
///         "001_users",
///         Some("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)".into()),
///         Some("DROP TABLE users".into()),
///     )),
///     Arc::new(SqlMigration::new(
///         "002_name_not_null",
///         Some("UPDATE users SET name = 'unknown' WHERE name IS NULL".into()),
///         None,
///     )),
/// ];
///
/// let db = RusqliteDatabase::open_in_memory()?;
/// MigrationTestBuilder::new(migrations)
///     .with_data_before("002_name_not_null", "INSERT INTO users (id) VALUES (1)")
///     .with_data_after("002_name_not_null", "UPDATE users SET name = upper(name)")
///     .skip_rollback()
///     .run(&db)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct MigrationTestBuilder {
    migrations: Vec<Arc<dyn Migration>>,
    data_before: BTreeMap<String, Vec<Box<dyn Executable>>>,
    data_after: BTreeMap<String, Vec<Box<dyn Executable>>>,
    table_name: String,
    skip_rollback: bool,
}

impl MigrationTestBuilder {
    pub fn new(migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self {
            migrations,
            data_before: BTreeMap::new(),
            data_after: BTreeMap::new(),
            table_name: DEFAULT_MIGRATIONS_TABLE.to_string(),
            skip_rollback: false,
        }
    }

    /// Run `step` just before migration `id` is applied.
    pub fn with_data_before(
        mut self,
        id: impl Into<String>,
        step: impl Executable + 'static,
    ) -> Self {
        self.data_before
            .entry(id.into())
            .or_default()
            .push(Box::new(step));
        self
    }

    /// Run `step` just after migration `id` is applied.
    pub fn with_data_after(
        mut self,
        id: impl Into<String>,
        step: impl Executable + 'static,
    ) -> Self {
        self.data_after
            .entry(id.into())
            .or_default()
            .push(Box::new(step));
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Leave the migrations applied when the run finishes.
    pub fn skip_rollback(mut self) -> Self {
        self.skip_rollback = true;
        self
    }

    fn runner(&self) -> MigrationRunner {
        MigrationRunner::from_migrations(self.migrations.clone()).with_table_name(&self.table_name)
    }

    /// Apply each migration in id order with its data steps around it, then roll back
    /// everything unless [`skip_rollback`](Self::skip_rollback) was set.
    ///
    /// Data steps registered for an id that no migration has fail with
    /// [`MigrationError::MigrationNotFound`] before anything runs.
    pub async fn run(&self, db: &dyn Database) -> Result<()> {
        let mut ids: Vec<&str> = self.migrations.iter().map(|m| m.id()).collect();
        ids.sort_unstable();

        for id in self.data_before.keys().chain(self.data_after.keys()) {
            if ids.binary_search(&id.as_str()).is_err() {
                return Err(MigrationError::MigrationNotFound(id.clone()));
            }
        }

        for id in ids {
            for step in self.data_before.get(id).into_iter().flatten() {
                step.execute(db).await?;
            }

            self.runner()
                .with_strategy(ExecutionStrategy::UpTo(id.to_string()))
                .run(db)
                .await?;

            for step in self.data_after.get(id).into_iter().flatten() {
                step.execute(db).await?;
            }
        }

        if !self.skip_rollback {
            self.runner().rollback(db, RollbackStrategy::All).await?;
        }
        Ok(())
    }
}
