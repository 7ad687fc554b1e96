//! Migrations defined in Rust.

use std::sync::Arc;

use async_trait::async_trait;

use crate::database::{Database, Executable};
use crate::error::{MigrationError, Result};
use crate::migration::{ensure_unique_ids, Migration, MigrationSource};

/// A migration whose `up` and optional `down` are [`Executable`]s: raw SQL strings,
/// schema-builder objects, or anything else implementing the trait.
///
/// ```
/// use sqlshift::discovery::CodeMigration;
/// use sqlshift::schema::{create_table, drop_table, Column, DataType};
///
/// let migration = CodeMigration::new(
///     "001_create_users",
///     Box::new(create_table("users").column(Column::new("id", DataType::Integer).primary_key())),
///     Some(Box::new(drop_table("users"))),
/// )
/// .with_description("Create the users table");
/// ```
pub struct CodeMigration {
    id: String,
    description: Option<String>,
    up: Box<dyn Executable>,
    down: Option<Box<dyn Executable>>,
}

impl CodeMigration {
    pub fn new(
        id: impl Into<String>,
        up: Box<dyn Executable>,
        down: Option<Box<dyn Executable>>,
    ) -> Self {
        Self {
            id: id.into(),
            description: None,
            up,
            down,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
impl Migration for CodeMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn up(&self, db: &dyn Database) -> Result<()> {
        self.up.execute(db).await?;
        Ok(())
    }

    fn supports_down(&self) -> bool {
        self.down.is_some()
    }

    async fn down(&self, db: &dyn Database) -> Result<()> {
        match &self.down {
            Some(down) => {
                down.execute(db).await?;
                Ok(())
            }
            None => Err(MigrationError::NoDownOperation(self.id.clone())),
        }
    }
}

/// An in-memory list of migrations registered in code.
#[derive(Default)]
pub struct CodeMigrationSource {
    migrations: Vec<Arc<dyn Migration>>,
}

impl CodeMigrationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`CodeMigration`].
    pub fn add_migration(mut self, migration: CodeMigration) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    /// Register any migration, such as one declared with [`sql_migration!`](crate::sql_migration).
    pub fn with_migration(mut self, migration: Arc<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl From<Vec<Arc<dyn Migration>>> for CodeMigrationSource {
    fn from(migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self { migrations }
    }
}

#[async_trait]
impl MigrationSource for CodeMigrationSource {
    async fn migrations(&self) -> Result<Vec<Arc<dyn Migration>>> {
        ensure_unique_ids(&self.migrations)?;
        Ok(self.migrations.clone())
    }
}
