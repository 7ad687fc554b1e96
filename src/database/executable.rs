//! Anything that can run against a [`Database`] handle.

use async_trait::async_trait;

use super::{Database, DatabaseError};

/// A unit of work that runs against a database or transaction handle.
///
/// Raw SQL text and schema-builder objects both implement this, so migrations can
/// mix them freely.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError>;
}

// Blank SQL is a successful no-op, which lets a migration exist only to be recorded.
#[async_trait]
impl Executable for str {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        if self.trim().is_empty() {
            return Ok(());
        }
        db.exec_raw(self).await
    }
}

#[async_trait]
impl Executable for &str {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        (**self).execute(db).await
    }
}

#[async_trait]
impl Executable for String {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        self.as_str().execute(db).await
    }
}

#[async_trait]
impl<T: Executable + ?Sized> Executable for Box<T> {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        (**self).execute(db).await
    }
}

#[async_trait]
impl<T: Executable> Executable for Vec<T> {
    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        for item in self {
            item.execute(db).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::database::sqlite::RusqliteDatabase;

    #[tokio::test]
    async fn blank_sql_does_nothing() {
        let db = RusqliteDatabase::open_in_memory().unwrap();
        "   \n\t".execute(&db).await.unwrap();
        String::new().execute(&db).await.unwrap();
    }

    #[tokio::test]
    async fn statements_run_in_order() {
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let steps: Vec<Box<dyn Executable>> = vec![
            Box::new("CREATE TABLE t (id INTEGER PRIMARY KEY)"),
            Box::new("INSERT INTO t (id) VALUES (1); INSERT INTO t (id) VALUES (2)".to_string()),
        ];
        steps.execute(&db).await.unwrap();

        let rows = db.query("SELECT COUNT(*) AS n FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get_i64("n").unwrap(), 2);
    }
}
