#![cfg_attr(docsrs, feature(doc_cfg))]
//! `sqlshift` applies and reverts versioned database schema migrations.
//!
//! Migrations are identified by string ids and always run in ascending id order. They can
//! come from three kinds of [sources](discovery):
//! - directories compiled into the binary with [`include_dir`](https://docs.rs/include_dir),
//! - directories read from disk at runtime,
//! - Rust code, either [`sql_migration!`] statements or hand-written [`Migration`] impls
//!   that receive a live connection and can read, transform and write data.
//!
//! Applied migrations are recorded in a tracking table (`__schema_migrations` by default)
//! by the [`VersionTracker`]. The [`MigrationRunner`] compares the source with that table
//! and applies or reverts the difference.
//!
//! # Example
//!
//! ```
//! use sqlshift::database::sqlite::RusqliteDatabase;
//! use sqlshift::{sql_migration, ExecutionStrategy, MigrationRunner, RollbackStrategy};
//! use std::sync::Arc;
//!
//! sql_migration!(CreateUsers, "001_create_users", "Create users table",
//!     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
//!     down: "DROP TABLE users"
//! );
//!
//! sql_migration!(AddEmail, "002_add_email", "Add email column",
//!     up: "ALTER TABLE users ADD COLUMN email TEXT",
//!     down: "ALTER TABLE users DROP COLUMN email"
//! );
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sqlshift::Result<()> {
//! let db = RusqliteDatabase::open_in_memory()?;
//! let runner = MigrationRunner::from_migrations(vec![Arc::new(CreateUsers), Arc::new(AddEmail)]);
//!
//! let report = runner.run(&db).await?;
//! assert_eq!(report.applied, vec!["001_create_users", "002_add_email"]);
//!
//! let report = runner.rollback(&db, RollbackStrategy::Last).await?;
//! assert_eq!(report.rolled_back, vec!["002_add_email"]);
//!
//! // nothing left to apply except the migration just reverted
//! let pending = runner.pending_migrations(&db).await?;
//! assert_eq!(pending.len(), 1);
//!
//! let preview = MigrationRunner::from_migrations(vec![Arc::new(CreateUsers), Arc::new(AddEmail)])
//!     .with_strategy(ExecutionStrategy::DryRun)
//!     .run(&db)
//!     .await?;
//! assert_eq!(preview.planned, vec!["002_add_email"]);
//! assert!(preview.applied.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `sqlite` - the [`RusqliteDatabase`](database::sqlite::RusqliteDatabase) backend.
//! - `embedded` - [`EmbeddedMigrationSource`](discovery::EmbeddedMigrationSource).
//! - `tracing` - spans and events for every migration.
//! - `testing` - [harnesses](testing) for exercising migrations in tests.

#[macro_use]
mod macros;

pub mod database;
pub mod discovery;
pub mod migration;
pub mod runner;
pub mod schema;
pub mod version;

mod error;
pub use error::{MigrationError, Result};

pub use migration::{Migration, MigrationInfo, MigrationSource, SqlMigration};
pub use runner::{
    ExecutionStrategy, MigrationHooks, MigrationReport, MigrationRunner, RollbackReport,
    RollbackStrategy,
};
pub use version::{AppliedMigration, VersionTracker, DEFAULT_MIGRATIONS_TABLE};

#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
}
