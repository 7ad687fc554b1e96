//! Migrations loaded from the filesystem at call time.
//!
//! ```text
//! migrations/
//! ├── 001_create_users/
//! │   ├── up.sql
//! │   └── down.sql
//! └── 002_seed_users/
//!     └── up.sql
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{DOWN_FILE, UP_FILE};
use crate::error::{MigrationError, Result};
use crate::migration::{Migration, MigrationSource, SqlMigration};

/// Reads `<root>/<id>/{up.sql,down.sql}` every time migrations are requested, so edits
/// on disk are picked up without rebuilding.
#[derive(Debug, Clone)]
pub struct DirectoryMigrationSource {
    root: PathBuf,
}

impl DirectoryMigrationSource {
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn discovery_error(path: &Path, error: impl std::fmt::Display) -> MigrationError {
    MigrationError::Discovery(format!("{}: {error}", path.display()))
}

/// `Ok(None)` when the file does not exist.
async fn read_sql(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| discovery_error(path, "file is not valid UTF-8")),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(discovery_error(path, e)),
    }
}

#[async_trait]
impl MigrationSource for DirectoryMigrationSource {
    async fn migrations(&self) -> Result<Vec<Arc<dyn Migration>>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| discovery_error(&self.root, e))?;

        let mut found: Vec<SqlMigration> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| discovery_error(&self.root, e))?
        {
            let path = entry.path();
            // follows symlinks, unlike DirEntry::file_type
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| discovery_error(&path, e))?;
            if !metadata.is_dir() {
                continue;
            }

            let id = entry
                .file_name()
                .into_string()
                .map_err(|_| discovery_error(&path, "directory name is not valid UTF-8"))?;

            let up = read_sql(&path.join(UP_FILE)).await?;
            let down = read_sql(&path.join(DOWN_FILE)).await?;
            if up.is_none() && down.is_none() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    path = %path.display(),
                    "Skipping directory without migration files"
                );
                continue;
            }

            found.push(SqlMigration::new(id, up, down));
        }

        // read_dir order is platform dependent
        found.sort_by(|a, b| a.id().cmp(b.id()));

        #[cfg(feature = "tracing")]
        tracing::debug!(root = %self.root.display(), count = found.len(), "Discovered migrations");

        Ok(found
            .into_iter()
            .map(|m| Arc::new(m) as Arc<dyn Migration>)
            .collect())
    }
}
