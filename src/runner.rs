//! # Migration runner
//!
//! [`MigrationRunner`] pulls migrations from a [`MigrationSource`], orders them by id,
//! consults the [`VersionTracker`] and applies or reverts them.
//!
//! Both directions are fail-fast: the first failing migration stops the batch and its
//! error is returned. Migrations that completed before it stay applied, the failing one
//! is left unrecorded and nothing after it is attempted. No recovery is attempted on
//! the caller's behalf; re-running after fixing the cause resumes at the failed
//! migration.
//!
//! With transactions enabled (the default) each migration's `up` or `down` runs in its
//! own transaction together with the tracking-table change, so a migration is either
//! applied and recorded or neither.
//!
//! Runners do not coordinate with each other. Running two against the same database at
//! once is not supported.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sqlshift::Result<()> {
//! use sqlshift::database::sqlite::RusqliteDatabase;
//! use sqlshift::discovery::{CodeMigration, CodeMigrationSource};
//! use sqlshift::runner::{ExecutionStrategy, MigrationRunner};
//!
//! let source = CodeMigrationSource::new()
//!     .add_migration(CodeMigration::new(
//!         "001_create_users",
//!         Box::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"),
//!         Some(Box::new("DROP TABLE users")),
//!     ))
//!     .add_migration(CodeMigration::new(
//!         "002_add_email",
//!         Box::new("ALTER TABLE users ADD COLUMN email TEXT"),
//!         None,
//!     ));
//!
//! let db = RusqliteDatabase::open_in_memory()?;
//! let runner = MigrationRunner::new(Box::new(source))
//!     .with_strategy(ExecutionStrategy::UpTo("001_create_users".to_string()));
//!
//! let report = runner.run(&db).await?;
//! assert_eq!(report.applied, vec!["001_create_users"]);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Timelike, Utc};

use crate::database::{Database, DatabaseTransaction};
use crate::discovery::{CodeMigrationSource, DirectoryMigrationSource};
use crate::error::{MigrationError, Result};
use crate::migration::{Migration, MigrationInfo, MigrationSource};
use crate::version::{AppliedMigration, VersionTracker};

/// Which pending migrations a forward run applies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Every pending migration.
    #[default]
    All,
    /// Pending migrations up to and including this id.
    UpTo(String),
    /// At most this many pending migrations.
    Steps(usize),
    /// Plan like [`All`](ExecutionStrategy::All) but execute nothing.
    DryRun,
}

/// Which applied migrations a rollback reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStrategy {
    /// The most recently applied migration.
    Last,
    /// The `n` most recently applied migrations.
    Steps(usize),
    /// Every migration applied after this id. The id itself stays applied.
    DownTo(String),
    /// Every applied migration.
    All,
}

/// Callbacks invoked around each migration, in both directions. Not invoked during a
/// dry run.
#[derive(Default)]
#[allow(clippy::type_complexity)]
pub struct MigrationHooks {
    /// Called with the migration id before it runs.
    pub on_migration_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Called with the migration id and elapsed time after it succeeds.
    pub on_migration_complete: Option<Box<dyn Fn(&str, Duration) + Send + Sync>>,
    /// Called with the migration id and the error when it fails.
    pub on_migration_error: Option<Box<dyn Fn(&str, &MigrationError) + Send + Sync>>,
}

impl std::fmt::Debug for MigrationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationHooks")
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field("on_migration_complete", &self.on_migration_complete.is_some())
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

/// Outcome of [`MigrationRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Ids selected for this run, in execution order.
    pub planned: Vec<String>,
    /// Ids that were applied. Empty for a dry run.
    pub applied: Vec<String>,
    pub dry_run: bool,
}

/// Outcome of [`MigrationRunner::rollback`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackReport {
    /// Ids selected for rollback, most recently applied first.
    pub planned: Vec<String>,
    /// Ids that were rolled back. Empty for a dry run.
    pub rolled_back: Vec<String>,
    pub dry_run: bool,
}

/// Applies and reverts migrations from a single source.
pub struct MigrationRunner {
    source: Box<dyn MigrationSource>,
    version_tracker: VersionTracker,
    strategy: ExecutionStrategy,
    hooks: MigrationHooks,
    dry_run: bool,
    use_transactions: bool,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("version_tracker", &self.version_tracker)
            .field("strategy", &self.strategy)
            .field("hooks", &self.hooks)
            .field("dry_run", &self.dry_run)
            .field("use_transactions", &self.use_transactions)
            .finish_non_exhaustive()
    }
}

impl MigrationRunner {
    pub fn new(source: Box<dyn MigrationSource>) -> Self {
        Self {
            source,
            version_tracker: VersionTracker::new(),
            strategy: ExecutionStrategy::All,
            hooks: MigrationHooks::default(),
            dry_run: false,
            use_transactions: true,
        }
    }

    /// A runner over migrations compiled into the binary.
    #[cfg(feature = "embedded")]
    #[cfg_attr(docsrs, doc(cfg(feature = "embedded")))]
    pub fn new_embedded(dir: &'static include_dir::Dir<'static>) -> Self {
        Self::new(Box::new(crate::discovery::EmbeddedMigrationSource::new(dir)))
    }

    /// A runner over `<path>/<id>/{up.sql,down.sql}`.
    pub fn new_directory(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(Box::new(DirectoryMigrationSource::from_path(
            path.as_ref().to_path_buf(),
        )))
    }

    /// A runner over an empty [`CodeMigrationSource`]. Use [`MigrationRunner::new`] or
    /// [`MigrationRunner::from_migrations`] to supply code migrations.
    pub fn new_code() -> Self {
        Self::new(Box::new(CodeMigrationSource::new()))
    }

    /// A runner over an explicit list of migrations.
    pub fn from_migrations(migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self::new(Box::new(CodeMigrationSource::from(migrations)))
    }

    pub fn with_version_tracker(mut self, version_tracker: VersionTracker) -> Self {
        self.version_tracker = version_tracker;
        self
    }

    /// Track applied migrations in `table_name` instead of the default table.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.version_tracker = VersionTracker::with_table_name(table_name);
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_hooks(mut self, hooks: MigrationHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_migration_start = Some(Box::new(callback));
        self
    }

    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_migration_complete = Some(Box::new(callback));
        self
    }

    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &MigrationError) + Send + Sync + 'static,
    {
        self.hooks.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Plan without executing anything, in both directions.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Whether each migration runs in its own transaction. Defaults to `true`.
    ///
    /// Disable for statements the backend refuses to run inside a transaction.
    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.use_transactions = enabled;
        self
    }

    pub fn version_tracker(&self) -> &VersionTracker {
        &self.version_tracker
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run || self.strategy == ExecutionStrategy::DryRun
    }

    /// Apply pending migrations according to the configured strategy.
    ///
    /// # Errors
    ///
    /// * [`MigrationError::MigrationNotFound`] if an `UpTo` target is not provided by
    ///   the source, before the database is touched
    /// * [`MigrationError::Discovery`] if the source cannot produce its migrations
    /// * the first error raised by a migration or by the tracking table, after which
    ///   the run stops
    pub async fn run(&self, db: &dyn Database) -> Result<MigrationReport> {
        let (plan, mut last_run_on) = self.forward_plan(db).await?;
        let planned: Vec<String> = plan.iter().map(|m| m.id().to_string()).collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            planned = ?planned,
            dry_run = self.is_dry_run(),
            "Planned migrations"
        );

        if self.is_dry_run() {
            return Ok(MigrationReport {
                planned,
                applied: Vec::new(),
                dry_run: true,
            });
        }

        let mut applied = Vec::with_capacity(plan.len());
        for migration in plan {
            let id = migration.id();
            let run_on = next_run_on(&mut last_run_on);

            let execution = self.apply_one(db, migration.as_ref(), run_on);
            #[cfg(feature = "tracing")]
            let execution = tracing::Instrument::instrument(
                execution,
                tracing::info_span!("migration_up", id = %id),
            );
            execution.await?;

            applied.push(id.to_string());
        }

        Ok(MigrationReport {
            planned,
            applied,
            dry_run: false,
        })
    }

    /// Revert applied migrations according to `strategy`.
    ///
    /// Every candidate is validated before the first `down` runs: a candidate the
    /// source does not provide fails with [`MigrationError::MigrationNotFound`], and
    /// one without a `down` fails with [`MigrationError::NoDownOperation`].
    pub async fn rollback(
        &self,
        db: &dyn Database,
        strategy: RollbackStrategy,
    ) -> Result<RollbackReport> {
        let migrations = self.sorted_migrations().await?;

        self.version_tracker.ensure_table(db).await?;
        let applied = self.version_tracker.applied_list(db).await?;

        let candidates: Vec<&AppliedMigration> = match &strategy {
            RollbackStrategy::Last => applied.iter().take(1).collect(),
            RollbackStrategy::Steps(n) => applied.iter().take(*n).collect(),
            RollbackStrategy::DownTo(target) => {
                let position = applied
                    .iter()
                    .position(|a| &a.id == target)
                    .ok_or_else(|| MigrationError::MigrationNotFound(target.clone()))?;
                applied[..position].iter().collect()
            }
            RollbackStrategy::All => applied.iter().collect(),
        };

        let mut plan = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let migration = migrations
                .get(&candidate.id)
                .ok_or_else(|| MigrationError::MigrationNotFound(candidate.id.clone()))?;
            if !migration.supports_down() {
                return Err(MigrationError::NoDownOperation(candidate.id.clone()));
            }
            plan.push(Arc::clone(migration));
        }
        let planned: Vec<String> = plan.iter().map(|m| m.id().to_string()).collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            strategy = ?strategy,
            planned = ?planned,
            dry_run = self.is_dry_run(),
            "Planned rollback"
        );

        if self.is_dry_run() {
            return Ok(RollbackReport {
                planned,
                rolled_back: Vec::new(),
                dry_run: true,
            });
        }

        let mut rolled_back = Vec::with_capacity(plan.len());
        for migration in plan {
            let id = migration.id();

            let execution = self.revert_one(db, migration.as_ref());
            #[cfg(feature = "tracing")]
            let execution = tracing::Instrument::instrument(
                execution,
                tracing::info_span!("migration_down", id = %id),
            );
            execution.await?;

            rolled_back.push(id.to_string());
        }

        Ok(RollbackReport {
            planned,
            rolled_back,
            dry_run: false,
        })
    }

    /// Every migration the source provides plus any applied id the source no longer
    /// provides, sorted by id.
    pub async fn list_migrations(&self, db: &dyn Database) -> Result<Vec<MigrationInfo>> {
        let migrations = self.sorted_migrations().await?;
        self.version_tracker.ensure_table(db).await?;
        let applied: BTreeMap<String, NaiveDateTime> = self
            .version_tracker
            .applied_list(db)
            .await?
            .into_iter()
            .map(|a| (a.id, a.run_on))
            .collect();

        let mut infos: BTreeMap<String, MigrationInfo> = migrations
            .values()
            .map(|m| {
                let mut info = MigrationInfo::pending(m.as_ref());
                if let Some(run_on) = applied.get(&info.id) {
                    info.applied = true;
                    info.run_on = Some(*run_on);
                }
                (info.id.clone(), info)
            })
            .collect();
        for (id, run_on) in applied {
            infos.entry(id.clone()).or_insert(MigrationInfo {
                id,
                description: None,
                applied: true,
                run_on: Some(run_on),
            });
        }

        Ok(infos.into_values().collect())
    }

    /// The tracking table's contents, most recently applied first.
    pub async fn applied_migrations(&self, db: &dyn Database) -> Result<Vec<AppliedMigration>> {
        self.version_tracker.ensure_table(db).await?;
        self.version_tracker.applied_list(db).await
    }

    /// What [`run`](MigrationRunner::run) would apply with the configured strategy.
    pub async fn pending_migrations(&self, db: &dyn Database) -> Result<Vec<MigrationInfo>> {
        let (plan, _) = self.forward_plan(db).await?;
        Ok(plan
            .iter()
            .map(|m| MigrationInfo::pending(m.as_ref()))
            .collect())
    }

    async fn sorted_migrations(&self) -> Result<BTreeMap<String, Arc<dyn Migration>>> {
        let mut sorted = BTreeMap::new();
        for migration in self.source.migrations().await? {
            let id = migration.id().to_string();
            if sorted.insert(id.clone(), migration).is_some() {
                return Err(MigrationError::Discovery(format!(
                    "duplicate migration id '{id}'"
                )));
            }
        }
        Ok(sorted)
    }

    /// Pending migrations selected by the strategy, plus the newest recorded `run_on`.
    async fn forward_plan(
        &self,
        db: &dyn Database,
    ) -> Result<(Vec<Arc<dyn Migration>>, Option<NaiveDateTime>)> {
        let migrations = self.sorted_migrations().await?;
        if let ExecutionStrategy::UpTo(target) = &self.strategy {
            if !migrations.contains_key(target) {
                return Err(MigrationError::MigrationNotFound(target.clone()));
            }
        }

        self.version_tracker.ensure_table(db).await?;
        let applied_list = self.version_tracker.applied_list(db).await?;
        let last_run_on = applied_list.iter().map(|a| a.run_on).max();
        let applied: BTreeSet<String> = applied_list.into_iter().map(|a| a.id).collect();

        let pending = migrations.into_iter().filter(|(id, _)| {
            let is_applied = applied.contains(id);
            if is_applied {
                #[cfg(feature = "tracing")]
                tracing::debug!(id = %id, "Skipping migration (already applied)");
            }
            !is_applied
        });

        let plan = match &self.strategy {
            ExecutionStrategy::All | ExecutionStrategy::DryRun => {
                pending.map(|(_, m)| m).collect()
            }
            ExecutionStrategy::UpTo(target) => pending
                .take_while(|(id, _)| id.as_str() <= target.as_str())
                .map(|(_, m)| m)
                .collect(),
            ExecutionStrategy::Steps(n) => pending.take(*n).map(|(_, m)| m).collect(),
        };
        Ok((plan, last_run_on))
    }

    async fn apply_one(
        &self,
        db: &dyn Database,
        migration: &dyn Migration,
        run_on: NaiveDateTime,
    ) -> Result<()> {
        let id = migration.id();

        #[cfg(feature = "tracing")]
        tracing::info!("Starting migration");
        if let Some(ref callback) = self.hooks.on_migration_start {
            callback(id);
        }
        let start = Instant::now();

        let result = if self.use_transactions {
            self.up_in_transaction(db, migration, run_on).await
        } else {
            self.up_and_record(db, migration, run_on).await
        };

        match result {
            Ok(()) => {
                let duration = start.elapsed();
                #[cfg(feature = "tracing")]
                tracing::info!(
                    duration_ms = duration.as_millis(),
                    "Migration completed successfully"
                );
                if let Some(ref callback) = self.hooks.on_migration_complete {
                    callback(id, duration);
                }
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Migration failed");
                if let Some(ref callback) = self.hooks.on_migration_error {
                    callback(id, &e);
                }
                Err(e)
            }
        }
    }

    async fn revert_one(&self, db: &dyn Database, migration: &dyn Migration) -> Result<()> {
        let id = migration.id();

        #[cfg(feature = "tracing")]
        tracing::info!("Rolling back migration");
        if let Some(ref callback) = self.hooks.on_migration_start {
            callback(id);
        }
        let start = Instant::now();

        let result = if self.use_transactions {
            self.down_in_transaction(db, migration).await
        } else {
            self.down_and_remove(db, migration).await
        };

        match result {
            Ok(()) => {
                let duration = start.elapsed();
                #[cfg(feature = "tracing")]
                tracing::info!(
                    duration_ms = duration.as_millis(),
                    "Migration rolled back successfully"
                );
                if let Some(ref callback) = self.hooks.on_migration_complete {
                    callback(id, duration);
                }
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Migration rollback failed");
                if let Some(ref callback) = self.hooks.on_migration_error {
                    callback(id, &e);
                }
                Err(e)
            }
        }
    }

    async fn up_and_record(
        &self,
        db: &dyn Database,
        migration: &dyn Migration,
        run_on: NaiveDateTime,
    ) -> Result<()> {
        migration.up(db).await?;
        self.version_tracker.record(db, migration.id(), run_on).await
    }

    async fn up_in_transaction(
        &self,
        db: &dyn Database,
        migration: &dyn Migration,
        run_on: NaiveDateTime,
    ) -> Result<()> {
        let tx = db.begin_transaction().await?;
        let result = self.up_and_record(&tx, migration, run_on).await;
        finish_transaction(tx, result).await
    }

    async fn down_and_remove(&self, db: &dyn Database, migration: &dyn Migration) -> Result<()> {
        migration.down(db).await?;
        self.version_tracker.remove(db, migration.id()).await
    }

    async fn down_in_transaction(
        &self,
        db: &dyn Database,
        migration: &dyn Migration,
    ) -> Result<()> {
        let tx = db.begin_transaction().await?;
        let result = self.down_and_remove(&tx, migration).await;
        finish_transaction(tx, result).await
    }
}

/// Commit on success; on failure roll back and return the original error.
async fn finish_transaction(tx: Box<dyn DatabaseTransaction>, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    error = %rollback_error,
                    "Failed to roll back migration transaction"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = rollback_error;
            }
            Err(e)
        }
    }
}

/// Current time, nudged past `last` so apply order and `run_on` order always agree.
fn next_run_on(last: &mut Option<NaiveDateTime>) -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    let now = now
        .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now);
    let run_on = match *last {
        Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
        _ => now,
    };
    *last = Some(run_on);
    run_on
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::database::sqlite::RusqliteDatabase;
    use crate::migration::SqlMigration;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    /// Creates table `t_<suffix>` on up and drops it on down, logging each call.
    struct TableMigration {
        id: String,
        table: String,
        reversible: bool,
        fail_up: bool,
        fail_down: bool,
        calls: Calls,
    }

    #[async_trait]
    impl Migration for TableMigration {
        fn id(&self) -> &str {
            &self.id
        }

        async fn up(&self, db: &dyn Database) -> Result<()> {
            self.calls.lock().unwrap().push(format!("up:{}", self.id));
            if self.fail_up {
                db.exec_raw("CREATE TABLE half_done (id INTEGER)").await?;
                db.exec_raw("NOT VALID SQL").await?;
            }
            db.exec_raw(&format!("CREATE TABLE {} (id INTEGER)", self.table))
                .await?;
            Ok(())
        }

        fn supports_down(&self) -> bool {
            self.reversible
        }

        async fn down(&self, db: &dyn Database) -> Result<()> {
            if !self.reversible {
                return Err(MigrationError::NoDownOperation(self.id.clone()));
            }
            self.calls.lock().unwrap().push(format!("down:{}", self.id));
            if self.fail_down {
                db.exec_raw("CREATE TABLE half_undone (id INTEGER)").await?;
                db.exec_raw("NOT VALID SQL").await?;
            }
            db.exec_raw(&format!("DROP TABLE {}", self.table)).await?;
            Ok(())
        }
    }

    fn migration(id: &str, calls: &Calls) -> Arc<dyn Migration> {
        Arc::new(TableMigration {
            id: id.to_string(),
            table: format!("t_{}", id.replace('-', "_")),
            reversible: true,
            fail_up: false,
            fail_down: false,
            calls: Arc::clone(calls),
        })
    }

    fn irreversible(id: &str, calls: &Calls) -> Arc<dyn Migration> {
        Arc::new(TableMigration {
            id: id.to_string(),
            table: format!("t_{id}"),
            reversible: false,
            fail_up: false,
            fail_down: false,
            calls: Arc::clone(calls),
        })
    }

    fn failing(id: &str, calls: &Calls) -> Arc<dyn Migration> {
        Arc::new(TableMigration {
            id: id.to_string(),
            table: format!("t_{id}"),
            reversible: true,
            fail_up: true,
            fail_down: false,
            calls: Arc::clone(calls),
        })
    }

    fn failing_down(id: &str, calls: &Calls) -> Arc<dyn Migration> {
        Arc::new(TableMigration {
            id: id.to_string(),
            table: format!("t_{id}"),
            reversible: true,
            fail_up: false,
            fail_down: true,
            calls: Arc::clone(calls),
        })
    }

    async fn table_exists(db: &RusqliteDatabase, name: &str) -> bool {
        !db.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[name.into()],
        )
        .await
        .unwrap()
        .is_empty()
    }

    async fn applied_ids(runner: &MigrationRunner, db: &RusqliteDatabase) -> Vec<String> {
        let mut ids: Vec<String> = runner
            .applied_migrations(db)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        ids.sort();
        ids
    }

    fn calls() -> Calls {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn applies_all_pending_in_id_order() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("003_c", &calls),
            migration("001_a", &calls),
            migration("002_b", &calls),
        ]);

        let report = runner.run(&db).await.unwrap();
        assert_eq!(report.applied, vec!["001_a", "002_b", "003_c"]);
        assert_eq!(report.planned, report.applied);
        assert!(!report.dry_run);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["up:001_a", "up:002_b", "up:003_c"]
        );

        // nothing left to do
        let report = runner.run(&db).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fail_fast_leaves_later_migrations_untouched() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("A", &calls),
            failing("B", &calls),
            migration("C", &calls),
        ]);

        let err = runner.run(&db).await.unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));

        assert_eq!(applied_ids(&runner, &db).await, vec!["A"]);
        assert_eq!(*calls.lock().unwrap(), vec!["up:A", "up:B"]);
        assert!(table_exists(&db, "t_A").await);
        // B's partial work was rolled back with its transaction
        assert!(!table_exists(&db, "half_done").await);
        assert!(!table_exists(&db, "t_C").await);
    }

    #[tokio::test]
    async fn fail_fast_without_transactions_keeps_partial_work() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("A", &calls),
            failing("B", &calls),
            migration("C", &calls),
        ])
        .with_transactions(false);

        assert!(runner.run(&db).await.is_err());
        assert_eq!(applied_ids(&runner, &db).await, vec!["A"]);
        assert!(table_exists(&db, "half_done").await);
        assert_eq!(*calls.lock().unwrap(), vec!["up:A", "up:B"]);
    }

    #[tokio::test]
    async fn up_to_then_all() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let migrations = vec![
            migration("2024-01-01_create_users", &calls),
            migration("2024-01-02_add_email", &calls),
        ];

        let report = MigrationRunner::from_migrations(migrations.clone())
            .with_strategy(ExecutionStrategy::UpTo(
                "2024-01-01_create_users".to_string(),
            ))
            .run(&db)
            .await
            .unwrap();
        assert_eq!(report.applied, vec!["2024-01-01_create_users"]);

        let report = MigrationRunner::from_migrations(migrations)
            .run(&db)
            .await
            .unwrap();
        assert_eq!(report.applied, vec!["2024-01-02_add_email"]);
    }

    #[tokio::test]
    async fn up_to_unknown_id_fails_before_touching_the_database() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![migration("001_a", &calls)])
            .with_strategy(ExecutionStrategy::UpTo("999_missing".to_string()));

        let err = runner.run(&db).await.unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(err, MigrationError::MigrationNotFound(id) if id == "999_missing"));
        assert!(!table_exists(&db, crate::version::DEFAULT_MIGRATIONS_TABLE).await);
    }

    #[tokio::test]
    async fn steps_counts_only_pending_migrations() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let migrations = vec![
            migration("001_a", &calls),
            migration("002_b", &calls),
            migration("003_c", &calls),
            migration("004_d", &calls),
        ];

        let runner =
            MigrationRunner::from_migrations(migrations).with_strategy(ExecutionStrategy::Steps(2));
        assert_eq!(runner.run(&db).await.unwrap().applied, vec!["001_a", "002_b"]);
        assert_eq!(runner.run(&db).await.unwrap().applied, vec!["003_c", "004_d"]);
        assert!(runner.run(&db).await.unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let started = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&started);

        for runner in [
            MigrationRunner::from_migrations(vec![migration("001_a", &calls)]).dry_run(),
            MigrationRunner::from_migrations(vec![migration("001_a", &calls)])
                .with_strategy(ExecutionStrategy::DryRun),
        ] {
            let counter = Arc::clone(&counter);
            let runner = runner.on_migration_start(move |_| *counter.lock().unwrap() += 1);
            let report = runner.run(&db).await.unwrap();
            assert!(report.dry_run);
            assert_eq!(report.planned, vec!["001_a"]);
            assert!(report.applied.is_empty());
            assert!(applied_ids(&runner, &db).await.is_empty());
        }

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(*started.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn rollback_last_reverts_only_the_most_recent() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("A", &calls),
            migration("B", &calls),
            migration("C", &calls),
        ]);
        runner.run(&db).await.unwrap();
        calls.lock().unwrap().clear();

        let report = runner.rollback(&db, RollbackStrategy::Last).await.unwrap();
        assert_eq!(report.rolled_back, vec!["C"]);
        assert_eq!(*calls.lock().unwrap(), vec!["down:C"]);
        assert_eq!(applied_ids(&runner, &db).await, vec!["A", "B"]);
        assert!(!table_exists(&db, "t_C").await);
        assert!(table_exists(&db, "t_B").await);
    }

    #[tokio::test]
    async fn rollback_steps_and_down_to() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            migration("002_b", &calls),
            migration("003_c", &calls),
            migration("004_d", &calls),
            migration("005_e", &calls),
        ]);
        runner.run(&db).await.unwrap();

        let report = runner
            .rollback(&db, RollbackStrategy::Steps(2))
            .await
            .unwrap();
        assert_eq!(report.rolled_back, vec!["005_e", "004_d"]);

        let report = runner
            .rollback(&db, RollbackStrategy::DownTo("001_a".to_string()))
            .await
            .unwrap();
        assert_eq!(report.rolled_back, vec!["003_c", "002_b"]);
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_a"]);

        let err = runner
            .rollback(&db, RollbackStrategy::DownTo("003_c".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MigrationNotFound(id) if id == "003_c"));

        let report = runner.rollback(&db, RollbackStrategy::All).await.unwrap();
        assert_eq!(report.rolled_back, vec!["001_a"]);
        assert!(runner
            .rollback(&db, RollbackStrategy::Last)
            .await
            .unwrap()
            .planned
            .is_empty());
    }

    #[tokio::test]
    async fn rollback_validates_every_candidate_first() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            irreversible("002_b", &calls),
            migration("003_c", &calls),
        ]);
        runner.run(&db).await.unwrap();
        calls.lock().unwrap().clear();

        let err = runner
            .rollback(&db, RollbackStrategy::All)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NoDownOperation(id) if id == "002_b"));
        // 003_c would have been reverted first, but nothing ran
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(
            applied_ids(&runner, &db).await,
            vec!["001_a", "002_b", "003_c"]
        );
    }

    #[tokio::test]
    async fn rollback_stops_at_first_failing_down() {
        let calls = calls();
        let errors: Calls = Arc::new(Mutex::new(Vec::new()));
        let db = RusqliteDatabase::open_in_memory().unwrap();

        let seen = Arc::clone(&errors);
        let runner = MigrationRunner::from_migrations(vec![
            migration("A", &calls),
            failing_down("B", &calls),
            migration("C", &calls),
        ])
        .on_migration_error(move |id, _| seen.lock().unwrap().push(id.to_string()));
        runner.run(&db).await.unwrap();
        calls.lock().unwrap().clear();

        let err = runner
            .rollback(&db, RollbackStrategy::All)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));

        assert_eq!(*calls.lock().unwrap(), vec!["down:C", "down:B"]);
        assert_eq!(*errors.lock().unwrap(), vec!["B"]);
        assert_eq!(applied_ids(&runner, &db).await, vec!["A", "B"]);
        assert!(!table_exists(&db, "t_C").await);
        assert!(table_exists(&db, "t_B").await);
        assert!(table_exists(&db, "t_A").await);
        // B's partial down work went with its transaction
        assert!(!table_exists(&db, "half_undone").await);
    }

    #[tokio::test]
    async fn rollback_of_migration_missing_from_source_is_rejected() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            migration("002_b", &calls),
        ])
        .run(&db)
            .await
            .unwrap();

        let runner = MigrationRunner::from_migrations(vec![migration("001_a", &calls)]);
        let err = runner.rollback(&db, RollbackStrategy::Last).await.unwrap_err();
        assert!(matches!(err, MigrationError::MigrationNotFound(id) if id == "002_b"));
    }

    #[tokio::test]
    async fn rollback_dry_run_previews() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let migrations = vec![migration("001_a", &calls), migration("002_b", &calls)];
        MigrationRunner::from_migrations(migrations.clone())
            .run(&db)
            .await
            .unwrap();

        let runner = MigrationRunner::from_migrations(migrations).dry_run();
        let report = runner.rollback(&db, RollbackStrategy::All).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.planned, vec!["002_b", "001_a"]);
        assert!(report.rolled_back.is_empty());
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_a", "002_b"]);
    }

    #[tokio::test]
    async fn round_trip_restores_schema() {
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            Arc::new(SqlMigration::new(
                "001_users",
                Some("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)".into()),
                Some("DROP TABLE users".into()),
            )),
            Arc::new(SqlMigration::new(
                "002_index",
                Some("CREATE INDEX idx_users_name ON users (name)".into()),
                Some("DROP INDEX idx_users_name".into()),
            )),
        ]);

        let schema = |db: RusqliteDatabase| async move {
            db.query(
                "SELECT name FROM sqlite_master WHERE name NOT LIKE '__schema%' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await
            .unwrap()
        };

        let before = schema(db.clone()).await;
        runner.run(&db).await.unwrap();
        assert_eq!(schema(db.clone()).await.len(), 2);
        runner.rollback(&db, RollbackStrategy::All).await.unwrap();
        assert_eq!(schema(db.clone()).await, before);
        assert!(runner.applied_migrations(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_are_deterministic() {
        let mut snapshots = Vec::new();
        for _ in 0..2 {
            let calls = calls();
            let db = RusqliteDatabase::open_in_memory().unwrap();
            let runner = MigrationRunner::from_migrations(vec![
                migration("002_b", &calls),
                migration("001_a", &calls),
            ]);
            runner.run(&db).await.unwrap();
            let tables = db
                .query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                    &[],
                )
                .await
                .unwrap();
            let ids = applied_ids(&runner, &db).await;
            snapshots.push((ids, tables, calls.lock().unwrap().clone()));
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[tokio::test]
    async fn empty_migration_is_recorded() {
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![Arc::new(SqlMigration::new(
            "001_empty",
            Some(String::new()),
            None,
        ))]);
        runner.run(&db).await.unwrap();
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_empty"]);
    }

    #[tokio::test]
    async fn hooks_observe_each_migration() {
        let calls = calls();
        let events: Calls = Arc::new(Mutex::new(Vec::new()));
        let db = RusqliteDatabase::open_in_memory().unwrap();

        let (start, complete, error) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            failing("002_b", &calls),
        ])
        .on_migration_start(move |id| start.lock().unwrap().push(format!("start:{id}")))
        .on_migration_complete(move |id, _| complete.lock().unwrap().push(format!("complete:{id}")))
        .on_migration_error(move |id, e| {
            assert!(matches!(e, MigrationError::Database(_)));
            error.lock().unwrap().push(format!("error:{id}"));
        });

        assert!(runner.run(&db).await.is_err());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start:001_a", "complete:001_a", "start:002_b", "error:002_b"]
        );
    }

    #[tokio::test]
    async fn list_migrations_merges_source_and_tracker() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        MigrationRunner::from_migrations(vec![migration("000_legacy", &calls)])
            .run(&db)
            .await
            .unwrap();

        let runner = MigrationRunner::from_migrations(vec![
            migration("002_b", &calls),
            migration("001_a", &calls),
        ])
        .with_strategy(ExecutionStrategy::Steps(1));
        runner.run(&db).await.unwrap();

        let list = runner.list_migrations(&db).await.unwrap();
        let summary: Vec<(&str, bool)> =
            list.iter().map(|i| (i.id.as_str(), i.applied)).collect();
        assert_eq!(
            summary,
            vec![("000_legacy", true), ("001_a", true), ("002_b", false)]
        );
        assert!(list[1].run_on.is_some());
        assert!(list[2].run_on.is_none());

        let pending = runner.pending_migrations(&db).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "002_b");
    }

    #[tokio::test]
    async fn custom_table_name_is_used() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![migration("001_a", &calls)])
            .with_table_name("app_migrations");
        runner.run(&db).await.unwrap();
        assert!(table_exists(&db, "app_migrations").await);
        assert!(!table_exists(&db, crate::version::DEFAULT_MIGRATIONS_TABLE).await);
    }

    #[tokio::test]
    async fn table_name_needing_quotes_is_used() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            migration("002_b", &calls),
        ])
        .with_table_name("app-migrations");

        runner.run(&db).await.unwrap();
        assert!(table_exists(&db, "app-migrations").await);
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_a", "002_b"]);

        runner.rollback(&db, RollbackStrategy::Last).await.unwrap();
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_a"]);
        assert_eq!(runner.run(&db).await.unwrap().applied, vec!["002_b"]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_a_discovery_error() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            migration("001_a", &calls),
        ]);
        assert!(matches!(
            runner.run(&db).await,
            Err(MigrationError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn directory_runner_applies_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("001_users")).unwrap();
        std::fs::write(
            dir.path().join("001_users/up.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        std::fs::write(dir.path().join("001_users/down.sql"), "DROP TABLE users;").unwrap();

        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::new_directory(dir.path());
        runner.run(&db).await.unwrap();
        assert!(table_exists(&db, "users").await);
        runner.rollback(&db, RollbackStrategy::Last).await.unwrap();
        assert!(!table_exists(&db, "users").await);
    }

    #[cfg(feature = "embedded")]
    #[tokio::test]
    async fn embedded_runner_applies_bundled_migrations() {
        static MIGRATIONS: include_dir::Dir =
            include_dir::include_dir!("$CARGO_MANIFEST_DIR/test_migrations");

        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::new_embedded(&MIGRATIONS);
        let report = runner.run(&db).await.unwrap();
        assert_eq!(
            report.applied,
            vec!["001_create_users", "002_add_email", "003_empty", "004_seed_users"]
        );
        let rows = db
            .query("SELECT COUNT(*) AS n FROM users WHERE email IS NOT NULL", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("n").unwrap(), 2);

        // 004 has no down.sql, which is a no-op; 003 likewise
        runner
            .rollback(&db, RollbackStrategy::DownTo("001_create_users".to_string()))
            .await
            .unwrap();
        let columns = db.query("PRAGMA table_info(users)", &[]).await.unwrap();
        assert_eq!(columns.len(), 2);
    }

    #[tokio::test]
    async fn new_code_runner_has_nothing_to_do() {
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let report = MigrationRunner::new_code().run(&db).await.unwrap();
        assert!(report.planned.is_empty());
    }

    #[tokio::test]
    async fn file_database_with_dedicated_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let db = RusqliteDatabase::open(dir.path().join("app.db")).unwrap();
        let calls = calls();
        let runner = MigrationRunner::from_migrations(vec![
            migration("001_a", &calls),
            migration("002_b", &calls),
        ]);
        runner.run(&db).await.unwrap();
        assert_eq!(applied_ids(&runner, &db).await, vec!["001_a", "002_b"]);
        runner.rollback(&db, RollbackStrategy::All).await.unwrap();
        assert!(applied_ids(&runner, &db).await.is_empty());
    }

    #[test]
    fn run_on_is_strictly_increasing() {
        let mut last = Some(Utc::now().naive_utc() + chrono::Duration::seconds(60));
        let first = next_run_on(&mut last);
        let second = next_run_on(&mut last);
        assert!(second > first);
        assert_eq!(last, Some(second));
    }

    #[tokio::test]
    #[cfg(feature = "tracing")]
    #[tracing_test::traced_test]
    async fn tracing_logs_successful_migration() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![migration("001_a", &calls)]);
        runner.run(&db).await.unwrap();
        runner.rollback(&db, RollbackStrategy::Last).await.unwrap();

        assert!(logs_contain("Starting migration"));
        assert!(logs_contain("Migration completed successfully"));
        assert!(logs_contain("duration_ms"));
        assert!(logs_contain("migration_up"));
        assert!(logs_contain("Rolling back migration"));
        assert!(logs_contain("Migration rolled back successfully"));
    }

    #[tokio::test]
    #[cfg(feature = "tracing")]
    #[tracing_test::traced_test]
    async fn tracing_logs_failed_migration() {
        let calls = calls();
        let db = RusqliteDatabase::open_in_memory().unwrap();
        let runner = MigrationRunner::from_migrations(vec![failing("001_a", &calls)]);
        let _ = runner.run(&db).await;

        assert!(logs_contain("Starting migration"));
        assert!(logs_contain("Migration failed"));
    }
}
