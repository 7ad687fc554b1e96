//! # Migration discovery
//!
//! Strategies for finding migrations. Every strategy implements
//! [`MigrationSource`](crate::migration::MigrationSource).
//!
//! * [`embedded`]: migrations compiled into the binary with `include_dir`. No runtime
//!   filesystem dependency, but changes need a rebuild.
//! * [`directory`]: migrations read from disk each time the source is asked. Handy
//!   during development.
//! * [`code`]: migrations defined in Rust, from raw SQL or schema-builder objects.
//!
//! The embedded and directory sources share one layout: each immediate subdirectory is
//! a migration whose id is the directory name, with optional `up.sql` and `down.sql`
//! files inside. A subdirectory holding neither file is skipped.

#[cfg(feature = "embedded")]
#[cfg_attr(docsrs, doc(cfg(feature = "embedded")))]
pub mod embedded;

pub mod directory;

pub mod code;

pub use code::{CodeMigration, CodeMigrationSource};
pub use directory::DirectoryMigrationSource;
#[cfg(feature = "embedded")]
pub use embedded::EmbeddedMigrationSource;

pub(crate) const UP_FILE: &str = "up.sql";
pub(crate) const DOWN_FILE: &str = "down.sql";
