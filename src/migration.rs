use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::database::{Database, Executable};
use crate::error::{MigrationError, Result};

/// A trait that must be implemented to define a migration.
///
/// The `id` must be unique among all migrations supplied by a source. Migrations are
/// applied in ascending byte-wise order of their ids, so ids are usually prefixed with a
/// zero-padded sequence number or a timestamp (`001_create_users`, `20240101_add_email`).
#[async_trait]
pub trait Migration: Send + Sync {
    /// Returns the id of this migration.
    ///
    /// # IMPORTANT WARNING
    ///
    /// **Once a migration has been applied to any database, its id must NEVER be changed.**
    /// The id is what the tracking table records. Renaming it makes the runner consider
    /// the migration pending again.
    fn id(&self) -> &str;

    /// Returns an optional human-readable description. Not used for tracking.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Apply this migration.
    async fn up(&self, db: &dyn Database) -> Result<()>;

    /// Whether [`down`](Migration::down) is implemented. Rollback refuses to touch any
    /// migration that returns `false` here.
    fn supports_down(&self) -> bool {
        false
    }

    /// Revert this migration. This is optional: the default implementation fails with
    /// [`MigrationError::NoDownOperation`].
    async fn down(&self, _db: &dyn Database) -> Result<()> {
        Err(MigrationError::NoDownOperation(self.id().to_string()))
    }
}

impl std::fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id())
            .field("description", &self.description())
            .field("supports_down", &self.supports_down())
            .finish()
    }
}

/// Metadata about a migration, as reported by a source or the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct MigrationInfo {
    pub id: String,
    pub description: Option<String>,
    /// Whether the tracking table holds a row for this id.
    pub applied: bool,
    /// When the migration was applied. Always `None` when `applied` is `false`.
    pub run_on: Option<NaiveDateTime>,
}

impl MigrationInfo {
    pub(crate) fn pending(migration: &dyn Migration) -> Self {
        Self {
            id: migration.id().to_string(),
            description: migration.description().map(str::to_string),
            applied: false,
            run_on: None,
        }
    }
}

/// Somewhere migrations come from.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Every migration this source provides, in any order.
    ///
    /// Fails with [`MigrationError::Discovery`] when the underlying storage is unreadable
    /// or malformed, or when two migrations share an id.
    async fn migrations(&self) -> Result<Vec<Arc<dyn Migration>>>;

    /// Metadata for every migration, sorted by id. Nothing here consults a database, so
    /// `applied` is always `false`.
    async fn list(&self) -> Result<Vec<MigrationInfo>> {
        let mut infos: Vec<MigrationInfo> = self
            .migrations()
            .await?
            .iter()
            .map(|m| MigrationInfo::pending(m.as_ref()))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }
}

/// Fails with [`MigrationError::Discovery`] on the first id that appears twice.
pub(crate) fn ensure_unique_ids(migrations: &[Arc<dyn Migration>]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for migration in migrations {
        if !seen.insert(migration.id()) {
            return Err(MigrationError::Discovery(format!(
                "duplicate migration id '{}'",
                migration.id()
            )));
        }
    }
    Ok(())
}

/// A migration backed by SQL text, as loaded by the directory and embedded sources.
///
/// Either side may be absent. An absent or whitespace-only side succeeds without
/// touching the database, and a file-backed migration always reports that it supports
/// `down`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    id: String,
    up: Option<String>,
    down: Option<String>,
}

impl SqlMigration {
    pub fn new(id: impl Into<String>, up: Option<String>, down: Option<String>) -> Self {
        Self {
            id: id.into(),
            up,
            down,
        }
    }

    pub fn up_sql(&self) -> Option<&str> {
        self.up.as_deref()
    }

    pub fn down_sql(&self) -> Option<&str> {
        self.down.as_deref()
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn id(&self) -> &str {
        &self.id
    }

    async fn up(&self, db: &dyn Database) -> Result<()> {
        if let Some(sql) = &self.up {
            sql.execute(db).await?;
        }
        Ok(())
    }

    fn supports_down(&self) -> bool {
        true
    }

    async fn down(&self, db: &dyn Database) -> Result<()> {
        if let Some(sql) = &self.down {
            sql.execute(db).await?;
        }
        Ok(())
    }
}
