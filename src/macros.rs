//! Convenience macros for defining migrations.

/// Define a migration made only of statements.
///
/// # Basic Usage
///
/// ```
/// use sqlshift::sql_migration;
///
/// sql_migration!(CreateUsersTable, "001_create_users", "Create users table",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
///     down: "DROP TABLE users"
/// );
/// ```
///
/// This expands to a unit struct `CreateUsersTable` implementing
/// [`Migration`](crate::migration::Migration).
///
/// # Multiple Statements
///
/// Statements are any [`Executable`](crate::database::Executable), so raw SQL and
/// schema-builder objects can be mixed. They run in order:
///
/// ```
/// use sqlshift::sql_migration;
/// use sqlshift::schema::{create_index, drop_index};
///
/// sql_migration!(InitialSchema, "001_initial_schema", "Create initial schema",
///     up: [
///         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///         "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT)",
///         create_index("idx_posts_user").on("posts", &["user_id"])
///     ],
///     down: [
///         drop_index("idx_posts_user"),
///         "DROP TABLE posts",
///         "DROP TABLE users"
///     ]
/// );
/// ```
///
/// # Up-Only Migrations
///
/// Omit `down` for migrations that cannot be reverted. Rolling back past such a
/// migration fails with [`MigrationError::NoDownOperation`](crate::MigrationError::NoDownOperation)
/// before anything is executed.
///
/// ```
/// use sqlshift::sql_migration;
///
/// sql_migration!(BackfillNames, "002_backfill_names", "Backfill display names",
///     up: "UPDATE users SET name = 'unknown' WHERE name IS NULL"
/// );
/// ```
///
/// For migrations that need to read data and transform it in Rust, implement
/// [`Migration`](crate::migration::Migration) directly instead.
#[macro_export]
macro_rules! sql_migration {
    ($name:ident, $id:expr, $description:expr,
        up: [$($up:expr),* $(,)?],
        down: [$($down:expr),* $(,)?] $(,)?
    ) => {
        $crate::__sql_migration_impl!($name, $id, $description,
            up: [$($up),*],
            down: [$($down),*]
        );
    };

    ($name:ident, $id:expr, $description:expr,
        up: $up:expr,
        down: $down:expr $(,)?
    ) => {
        $crate::__sql_migration_impl!($name, $id, $description,
            up: [$up],
            down: [$down]
        );
    };

    ($name:ident, $id:expr, $description:expr,
        up: [$($up:expr),* $(,)?] $(,)?
    ) => {
        $crate::__sql_migration_impl!($name, $id, $description,
            up: [$($up),*]
        );
    };

    ($name:ident, $id:expr, $description:expr,
        up: $up:expr $(,)?
    ) => {
        $crate::__sql_migration_impl!($name, $id, $description,
            up: [$up]
        );
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __sql_migration_impl {
    ($name:ident, $id:expr, $description:expr,
        up: [$($up:expr),*],
        down: [$($down:expr),*]
    ) => {
        pub struct $name;

        #[$crate::__private::async_trait]
        impl $crate::migration::Migration for $name {
            fn id(&self) -> &str {
                $id
            }

            fn description(&self) -> ::std::option::Option<&str> {
                ::std::option::Option::Some($description)
            }

            async fn up(&self, db: &dyn $crate::database::Database) -> $crate::Result<()> {
                $( $crate::database::Executable::execute(&$up, db).await?; )*
                ::std::result::Result::Ok(())
            }

            fn supports_down(&self) -> bool {
                true
            }

            async fn down(&self, db: &dyn $crate::database::Database) -> $crate::Result<()> {
                $( $crate::database::Executable::execute(&$down, db).await?; )*
                ::std::result::Result::Ok(())
            }
        }
    };

    ($name:ident, $id:expr, $description:expr,
        up: [$($up:expr),*]
    ) => {
        pub struct $name;

        #[$crate::__private::async_trait]
        impl $crate::migration::Migration for $name {
            fn id(&self) -> &str {
                $id
            }

            fn description(&self) -> ::std::option::Option<&str> {
                ::std::option::Option::Some($description)
            }

            async fn up(&self, db: &dyn $crate::database::Database) -> $crate::Result<()> {
                $( $crate::database::Executable::execute(&$up, db).await?; )*
                ::std::result::Result::Ok(())
            }
        }
    };
}
