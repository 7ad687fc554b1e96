//! Schema builder.
//!
//! Fluent builders for the DDL statements migrations commonly need. Each builder
//! renders SQL for the [`SqlDialect`] of the database it runs against and implements
//! [`Executable`], so it can be used anywhere raw SQL can.
//!
//! ```
//! use sqlshift::schema::{create_table, Column, DataType, DefaultValue};
//! use sqlshift::database::SqlDialect;
//!
//! let users = create_table("users")
//!     .if_not_exists()
//!     .column(Column::new("id", DataType::BigInt).primary_key().auto_increment())
//!     .column(Column::new("email", DataType::VarChar(255)).not_null().unique())
//!     .column(Column::new("created_at", DataType::Timestamp).default(DefaultValue::CurrentTimestamp));
//!
//! assert_eq!(
//!     users.to_sql(SqlDialect::Sqlite),
//!     "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
//!      \"email\" VARCHAR(255) NOT NULL UNIQUE, \"created_at\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
//! );
//! ```

use async_trait::async_trait;

use crate::database::{Database, DatabaseError, Executable, SqlDialect};

pub(crate) fn quote(dialect: SqlDialect, identifier: &str) -> String {
    match dialect {
        SqlDialect::MySql => format!("`{}`", identifier.replace('`', "``")),
        SqlDialect::Sqlite | SqlDialect::Postgres => {
            format!("\"{}\"", identifier.replace('"', "\"\""))
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Column data types understood by every dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Integer,
    BigInt,
    Text,
    VarChar(u16),
    Boolean,
    Real,
    Timestamp,
}

impl DataType {
    fn to_sql(&self, dialect: SqlDialect, primary_key: bool) -> String {
        match (dialect, self) {
            (SqlDialect::Sqlite, DataType::Integer | DataType::BigInt) => "INTEGER".into(),
            (SqlDialect::Sqlite, DataType::Real) => "REAL".into(),
            (SqlDialect::Postgres, DataType::Integer) => "INTEGER".into(),
            (SqlDialect::Postgres, DataType::Real) => "DOUBLE PRECISION".into(),
            (SqlDialect::MySql, DataType::Integer) => "INT".into(),
            (SqlDialect::MySql, DataType::Real) => "DOUBLE".into(),
            // MySQL cannot index unbounded TEXT as a key
            (SqlDialect::MySql, DataType::Text) if primary_key => "VARCHAR(255)".into(),
            (SqlDialect::MySql, DataType::Timestamp) => "DATETIME(6)".into(),
            (_, DataType::BigInt) => "BIGINT".into(),
            (_, DataType::Text) => "TEXT".into(),
            (_, DataType::VarChar(n)) => format!("VARCHAR({n})"),
            (_, DataType::Boolean) => "BOOLEAN".into(),
            (_, DataType::Timestamp) => "TIMESTAMP".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    CurrentTimestamp,
}

impl DefaultValue {
    fn to_sql(&self, dialect: SqlDialect) -> String {
        match self {
            DefaultValue::Null => "NULL".into(),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Text(s) => quote_literal(s),
            DefaultValue::Boolean(b) => match dialect {
                SqlDialect::Postgres => b.to_string().to_uppercase(),
                SqlDialect::Sqlite | SqlDialect::MySql => (*b as i64).to_string(),
            },
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".into(),
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    data_type: DataType,
    nullable: bool,
    primary_key: bool,
    auto_increment: bool,
    unique: bool,
    default: Option<DefaultValue>,
}

impl Column {
    /// A nullable column with no constraints.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Primary key columns are implicitly `NOT NULL`.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_sql(&self, dialect: SqlDialect, inline_primary_key: bool) -> String {
        let primary_key = self.primary_key && inline_primary_key;
        let mut sql = quote(dialect, &self.name);
        sql.push(' ');

        match (dialect, self.auto_increment) {
            (SqlDialect::Postgres, true) => sql.push_str(match self.data_type {
                DataType::BigInt => "BIGSERIAL",
                _ => "SERIAL",
            }),
            _ => sql.push_str(&self.data_type.to_sql(dialect, self.primary_key)),
        }

        if primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.auto_increment && dialect == SqlDialect::Sqlite {
                sql.push_str(" AUTOINCREMENT");
            }
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }

        if self.auto_increment && dialect == SqlDialect::MySql {
            sql.push_str(" AUTO_INCREMENT");
        }
        if self.unique && !primary_key {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql(dialect));
        }
        sql
    }
}

/// `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    name: String,
    if_not_exists: bool,
    columns: Vec<Column>,
}

pub fn create_table(name: impl Into<String>) -> CreateTable {
    CreateTable {
        name: name.into(),
        if_not_exists: false,
        columns: Vec::new(),
    }
}

impl CreateTable {
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        let primary_keys: Vec<&Column> = self.columns.iter().filter(|c| c.primary_key).collect();
        let inline_primary_key = primary_keys.len() == 1;

        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.to_sql(dialect, inline_primary_key))
            .collect();
        if primary_keys.len() > 1 {
            definitions.push(format!(
                "PRIMARY KEY ({})",
                primary_keys
                    .iter()
                    .map(|c| quote(dialect, &c.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        format!(
            "CREATE TABLE {}{} ({})",
            if self.if_not_exists { "IF NOT EXISTS " } else { "" },
            quote(dialect, &self.name),
            definitions.join(", ")
        )
    }
}

/// `DROP TABLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct DropTable {
    name: String,
    if_exists: bool,
}

pub fn drop_table(name: impl Into<String>) -> DropTable {
    DropTable {
        name: name.into(),
        if_exists: false,
    }
}

impl DropTable {
    pub fn if_exists(mut self) -> Self {
        self.if_exists = true;
        self
    }

    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "DROP TABLE {}{}",
            if self.if_exists { "IF EXISTS " } else { "" },
            quote(dialect, &self.name)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AlterOperation {
    AddColumn(Column),
    DropColumn(String),
    RenameColumn { from: String, to: String },
    RenameTo(String),
}

/// `ALTER TABLE`. Each operation renders as its own statement, since SQLite accepts
/// only one change per `ALTER TABLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterTable {
    name: String,
    operations: Vec<AlterOperation>,
}

pub fn alter_table(name: impl Into<String>) -> AlterTable {
    AlterTable {
        name: name.into(),
        operations: Vec::new(),
    }
}

impl AlterTable {
    pub fn add_column(mut self, column: Column) -> Self {
        self.operations.push(AlterOperation::AddColumn(column));
        self
    }

    pub fn drop_column(mut self, name: impl Into<String>) -> Self {
        self.operations.push(AlterOperation::DropColumn(name.into()));
        self
    }

    pub fn rename_column(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.operations.push(AlterOperation::RenameColumn {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn rename_to(mut self, name: impl Into<String>) -> Self {
        self.operations.push(AlterOperation::RenameTo(name.into()));
        self
    }

    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        let table = quote(dialect, &self.name);
        self.operations
            .iter()
            .map(|operation| match operation {
                AlterOperation::AddColumn(column) => format!(
                    "ALTER TABLE {table} ADD COLUMN {}",
                    column.to_sql(dialect, true)
                ),
                AlterOperation::DropColumn(name) => {
                    format!("ALTER TABLE {table} DROP COLUMN {}", quote(dialect, name))
                }
                AlterOperation::RenameColumn { from, to } => format!(
                    "ALTER TABLE {table} RENAME COLUMN {} TO {}",
                    quote(dialect, from),
                    quote(dialect, to)
                ),
                AlterOperation::RenameTo(name) => {
                    format!("ALTER TABLE {table} RENAME TO {}", quote(dialect, name))
                }
            })
            .collect::<Vec<_>>()
            .join(";\n")
    }
}

/// `CREATE INDEX`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    name: String,
    table: String,
    columns: Vec<String>,
    unique: bool,
    if_not_exists: bool,
}

pub fn create_index(name: impl Into<String>) -> CreateIndex {
    CreateIndex {
        name: name.into(),
        table: String::new(),
        columns: Vec::new(),
        unique: false,
        if_not_exists: false,
    }
}

impl CreateIndex {
    pub fn on(mut self, table: impl Into<String>, columns: &[&str]) -> Self {
        self.table = table.into();
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Ignored for MySQL, which has no `IF NOT EXISTS` for indexes.
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        let if_not_exists = self.if_not_exists && dialect != SqlDialect::MySql;
        format!(
            "CREATE {}INDEX {}{} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote(dialect, &self.name),
            quote(dialect, &self.table),
            self.columns
                .iter()
                .map(|c| quote(dialect, c))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// `DROP INDEX`. MySQL needs the owning table.
#[derive(Debug, Clone, PartialEq)]
pub struct DropIndex {
    name: String,
    table: Option<String>,
    if_exists: bool,
}

pub fn drop_index(name: impl Into<String>) -> DropIndex {
    DropIndex {
        name: name.into(),
        table: None,
        if_exists: false,
    }
}

impl DropIndex {
    pub fn on(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn if_exists(mut self) -> Self {
        self.if_exists = true;
        self
    }

    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        match (dialect, &self.table) {
            (SqlDialect::MySql, Some(table)) => format!(
                "DROP INDEX {} ON {}",
                quote(dialect, &self.name),
                quote(dialect, table)
            ),
            _ => format!(
                "DROP INDEX {}{}",
                if self.if_exists { "IF EXISTS " } else { "" },
                quote(dialect, &self.name)
            ),
        }
    }
}

macro_rules! impl_executable {
    ($($builder:ty),*) => {
        $(
            #[async_trait]
            impl Executable for $builder {
                async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
                    db.exec_raw(&self.to_sql(db.sql_dialect())).await
                }
            }
        )*
    };
}

impl_executable!(CreateTable, DropTable, AlterTable, CreateIndex, DropIndex);
