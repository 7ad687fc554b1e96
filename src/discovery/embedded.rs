//! Migrations compiled into the binary.
//!
//! ```
//! use include_dir::{include_dir, Dir};
//! use sqlshift::discovery::EmbeddedMigrationSource;
//!
//! static MIGRATIONS: Dir = include_dir!("$CARGO_MANIFEST_DIR/test_migrations");
//!
//! let source = EmbeddedMigrationSource::new(&MIGRATIONS);
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use include_dir::Dir;

use super::{DOWN_FILE, UP_FILE};
use crate::error::{MigrationError, Result};
use crate::migration::{Migration, MigrationSource, SqlMigration};

/// Serves migrations from a directory tree bundled with `include_dir!`.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedMigrationSource {
    dir: &'static Dir<'static>,
}

impl EmbeddedMigrationSource {
    pub fn new(dir: &'static Dir<'static>) -> Self {
        Self { dir }
    }
}

fn file_contents(dir: &Dir<'_>, name: &str) -> Result<Option<String>> {
    let Some(file) = dir
        .files()
        .find(|f| f.path().file_name().is_some_and(|n| n == name))
    else {
        return Ok(None);
    };
    file.contents_utf8().map(|s| Some(s.to_string())).ok_or_else(|| {
        MigrationError::Discovery(format!(
            "{}: file is not valid UTF-8",
            file.path().display()
        ))
    })
}

fn migration_id(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            MigrationError::Discovery(format!(
                "{}: directory name is not valid UTF-8",
                path.display()
            ))
        })
}

#[async_trait]
impl MigrationSource for EmbeddedMigrationSource {
    async fn migrations(&self) -> Result<Vec<Arc<dyn Migration>>> {
        let mut found = Vec::new();
        for sub in self.dir.dirs() {
            let up = file_contents(sub, UP_FILE)?;
            let down = file_contents(sub, DOWN_FILE)?;
            if up.is_none() && down.is_none() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    path = %sub.path().display(),
                    "Skipping directory without migration files"
                );
                continue;
            }
            found.push(SqlMigration::new(migration_id(sub.path())?, up, down));
        }
        found.sort_by(|a, b| a.id().cmp(b.id()));

        Ok(found
            .into_iter()
            .map(|m| Arc::new(m) as Arc<dyn Migration>)
            .collect())
    }
}
