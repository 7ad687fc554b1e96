//! Testing utilities for migration development and verification.
//!
//! [`SqliteTestHarness`] drives a migration list against an in-memory database and
//! offers schema assertions and snapshots. [`MigrationTestBuilder`] walks the list one
//! migration at a time with seed data around chosen migrations, then rolls back.

mod builder;
mod sqlite;

pub use builder::MigrationTestBuilder;
pub use sqlite::{ColumnInfo, IndexInfo, SchemaSnapshot, SqliteTestHarness, TableSchema};
