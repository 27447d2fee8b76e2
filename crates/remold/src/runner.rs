//! Migration runner.
//!
//! Sequences migrations against one exclusively owned connection:
//!
//! 1. take the advisory lock derived from the ledger table,
//! 2. create the ledger table if needed,
//! 3. refuse to run if a pending migration is older than an applied one,
//! 4. run each migration in its own transaction, in ascending version order,
//!    halting at the first failure,
//! 5. release the lock, whatever happened.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Transaction};

use crate::executor::{ApplyOutcome, RevertReport};
use crate::ledger::PgLedger;
use crate::traced::ConnectionExt;
use crate::{
    AdvisoryLock, AppliedMigration, Catalog, Error, Ledger, Migration, Operation, PgCatalog,
    PgSession, Result, apply, lock_key, preview, revert, validate_order,
};

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub ledger_table: String,
    /// Applied to every statement of a migration transaction.
    pub statement_timeout: Option<Duration>,
    /// Advisory lock key. Derived from the ledger table when unset.
    pub lock_key: Option<i64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ledger_table: "migrations".to_string(),
            statement_timeout: Some(Duration::from_secs(30)),
            lock_key: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = Some(key);
        self
    }

    pub fn resolved_lock_key(&self) -> i64 {
        self.lock_key.unwrap_or_else(|| lock_key(&self.ledger_table))
    }

    fn validate(&self) -> Result<()> {
        if self.ledger_table.trim().is_empty() {
            return Err(Error::Config("ledger table name is empty".to_string()));
        }
        if self.statement_timeout == Some(Duration::ZERO) {
            // Postgres reads a zero timeout as "no timeout".
            return Err(Error::Config(
                "statement timeout must be positive; use None to disable it".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one migration within a batch.
#[derive(Debug)]
pub enum MigrationOutcome {
    Applied {
        state: &'static str,
        operations_run: usize,
        operations_skipped: usize,
    },
    SkippedAlreadyApplied,
    SkippedAlreadyInTargetShape {
        state: &'static str,
    },
    Failed(Error),
}

impl MigrationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MigrationOutcome::Applied { .. } => "applied",
            MigrationOutcome::SkippedAlreadyApplied => "skipped_already_applied",
            MigrationOutcome::SkippedAlreadyInTargetShape { .. } => {
                "skipped_already_in_target_shape"
            }
            MigrationOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MigrationOutcome::Failed(_))
    }
}

impl From<Result<ApplyOutcome>> for MigrationOutcome {
    fn from(result: Result<ApplyOutcome>) -> Self {
        match result {
            Ok(ApplyOutcome::AlreadyApplied) => MigrationOutcome::SkippedAlreadyApplied,
            Ok(ApplyOutcome::AlreadyInTargetShape { state }) => {
                MigrationOutcome::SkippedAlreadyInTargetShape { state }
            }
            Ok(ApplyOutcome::Applied {
                state,
                operations_run,
                operations_skipped,
            }) => MigrationOutcome::Applied {
                state,
                operations_run: operations_run.len(),
                operations_skipped: operations_skipped.len(),
            },
            Err(err) => MigrationOutcome::Failed(err),
        }
    }
}

#[derive(Debug)]
pub struct MigrationReport {
    pub name: String,
    pub version: i64,
    pub outcome: MigrationOutcome,
    pub duration: Duration,
}

/// Per-migration results of [`MigrationRunner::run_all`], in execution order.
///
/// Migrations after a failure are not attempted and do not appear.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub reports: Vec<MigrationReport>,
}

impl BatchResult {
    /// The failed migration, if the batch halted.
    pub fn failed(&self) -> Option<&MigrationReport> {
        self.reports.iter().find(|r| r.outcome.is_failed())
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_none()
    }

    pub fn applied(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, MigrationOutcome::Applied { .. }))
            .count()
    }
}

/// Results of [`MigrationRunner::revert_last`], newest first.
#[derive(Debug, Default)]
pub struct RevertBatch {
    /// Committed reverts.
    pub reverted: Vec<RevertReport>,
    /// The migration whose revert failed, if the batch halted.
    pub failed: Option<(String, Error)>,
}

impl RevertBatch {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Whether any committed revert left rows it could not restore.
    pub fn is_lossy(&self) -> bool {
        self.reverted.iter().any(RevertReport::is_lossy)
    }
}

/// Ledger view of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub version: i64,
    pub applied_at: Option<DateTime<Utc>>,
    /// False for ledger rows that match no known migration.
    pub known: bool,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// What `run_all` would do for one pending migration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMigration {
    pub name: String,
    pub version: i64,
    pub state: &'static str,
    /// Operations whose guards hold; empty when the schema is already in shape.
    pub operations: Vec<Operation>,
}

/// Runs migrations over a connection it holds exclusively.
pub struct MigrationRunner<'c> {
    client: &'c mut Client,
    config: RunnerConfig,
}

impl<'c> MigrationRunner<'c> {
    pub fn new(client: &'c mut Client) -> Self {
        Self::with_config(client, RunnerConfig::default())
    }

    pub fn with_config(client: &'c mut Client, config: RunnerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Apply every pending migration, in order, under the advisory lock.
    pub async fn run_all(&mut self, migrations: &[Box<dyn Migration>]) -> Result<BatchResult> {
        self.config.validate()?;
        validate_order(migrations)?;

        let lock = self.lock().await?;
        let result = self.run_locked(migrations).await;
        self.unlock(lock, result).await
    }

    async fn run_locked(&mut self, migrations: &[Box<dyn Migration>]) -> Result<BatchResult> {
        let applied = self.prepare_ledger().await?;
        check_order(migrations, &applied)?;

        tracing::info!(count = migrations.len(), "running migrations");
        let mut batch = BatchResult::default();
        for migration in migrations {
            let start = Instant::now();
            let outcome = MigrationOutcome::from(self.apply_one(migration.as_ref()).await);
            let report = MigrationReport {
                name: migration.name().to_string(),
                version: migration.version(),
                outcome,
                duration: start.elapsed(),
            };
            log_report(&report);

            let failed = report.outcome.is_failed();
            batch.reports.push(report);
            if failed {
                break;
            }
        }
        Ok(batch)
    }

    async fn apply_one(&mut self, migration: &dyn Migration) -> Result<ApplyOutcome> {
        let tx = begin(&mut *self.client, self.config.statement_timeout).await?;
        let result = {
            let session = PgSession::new(&tx, &self.config.ledger_table);
            apply(&session, migration).await
        };
        finish(tx, result).await
    }

    /// Revert one applied migration in its own transaction, under the lock.
    pub async fn revert(&mut self, migration: &dyn Migration) -> Result<RevertReport> {
        self.config.validate()?;
        let lock = self.lock().await?;
        let result = match self.prepare_ledger().await {
            Ok(_) => self.revert_one(migration).await,
            Err(err) => Err(err),
        };
        self.unlock(lock, result).await
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    ///
    /// Stops at the first failure; reverts before it stay committed and are
    /// reported alongside the failure.
    pub async fn revert_last(
        &mut self,
        migrations: &[Box<dyn Migration>],
        steps: usize,
    ) -> Result<RevertBatch> {
        self.config.validate()?;
        let lock = self.lock().await?;
        let result = self.revert_last_locked(migrations, steps).await;
        self.unlock(lock, result).await
    }

    async fn revert_last_locked(
        &mut self,
        migrations: &[Box<dyn Migration>],
        steps: usize,
    ) -> Result<RevertBatch> {
        let applied = self.prepare_ledger().await?;

        let mut batch = RevertBatch::default();
        for record in applied.iter().rev().take(steps) {
            let result = match migrations.iter().find(|m| m.name() == record.name) {
                Some(migration) => self.revert_one(migration.as_ref()).await,
                None => Err(Error::UnknownMigration(record.name.clone())),
            };
            match result {
                Ok(report) => batch.reverted.push(report),
                Err(err) => {
                    batch.failed = Some((record.name.clone(), err));
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn revert_one(&mut self, migration: &dyn Migration) -> Result<RevertReport> {
        let start = Instant::now();
        let tx = begin(&mut *self.client, self.config.statement_timeout).await?;
        let result = {
            let session = PgSession::new(&tx, &self.config.ledger_table);
            revert(&session, migration).await
        };
        let result = finish(tx, result).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => tracing::info!(
                migration = migration.name(),
                version = migration.version(),
                outcome = "reverted",
                state = report.state,
                operations = report.operations_run.len(),
                lossy = report.is_lossy(),
                duration_ms,
                "migration reverted"
            ),
            Err(err) => tracing::error!(
                migration = migration.name(),
                version = migration.version(),
                outcome = "failed",
                duration_ms,
                error = %err,
                "revert failed"
            ),
        }
        result
    }

    /// Applied flag and timestamp for every known migration, plus orphaned
    /// ledger rows. Does not create the ledger table.
    pub async fn status(
        &mut self,
        migrations: &[Box<dyn Migration>],
    ) -> Result<Vec<MigrationStatus>> {
        let conn: &Client = &*self.client;
        let ledger_exists = PgCatalog::new(conn)
            .table_exists(&self.config.ledger_table)
            .await?;
        let applied = if ledger_exists {
            PgLedger::new(conn, &self.config.ledger_table)
                .applied()
                .await?
        } else {
            Vec::new()
        };

        let mut statuses: Vec<_> = migrations
            .iter()
            .map(|m| MigrationStatus {
                name: m.name().to_string(),
                version: m.version(),
                applied_at: applied
                    .iter()
                    .find(|a| a.name == m.name())
                    .map(|a| a.applied_at),
                known: true,
            })
            .collect();

        for record in &applied {
            if !migrations.iter().any(|m| m.name() == record.name) {
                statuses.push(MigrationStatus {
                    name: record.name.clone(),
                    version: record.version,
                    applied_at: Some(record.applied_at),
                    known: false,
                });
            }
        }
        statuses.sort_by_key(|s| s.version);
        Ok(statuses)
    }

    /// Dry run of `run_all`.
    ///
    /// Pending migrations are applied one after another inside a single
    /// transaction so each sees the shape its predecessors leave behind; the
    /// transaction is always rolled back.
    pub async fn plan(
        &mut self,
        migrations: &[Box<dyn Migration>],
    ) -> Result<Vec<PlannedMigration>> {
        self.config.validate()?;
        validate_order(migrations)?;

        let lock = self.lock().await?;
        let result = self.plan_locked(migrations).await;
        self.unlock(lock, result).await
    }

    async fn plan_locked(
        &mut self,
        migrations: &[Box<dyn Migration>],
    ) -> Result<Vec<PlannedMigration>> {
        let table = &self.config.ledger_table;
        let tx = begin(&mut *self.client, self.config.statement_timeout).await?;
        let result = async {
            let ledger = PgLedger::new(&tx, table);
            ledger.ensure_table().await?;
            check_order(migrations, &ledger.applied().await?)?;

            let session = PgSession::new(&tx, table);
            let mut planned = Vec::new();
            for migration in migrations {
                if session.is_applied(migration.name()).await? {
                    continue;
                }
                let (state, operations) = preview(&session, migration.as_ref()).await?;
                apply(&session, migration.as_ref()).await?;
                planned.push(PlannedMigration {
                    name: migration.name().to_string(),
                    version: migration.version(),
                    state,
                    operations,
                });
            }
            Ok::<_, Error>(planned)
        }
        .await;

        if let Err(err) = tx.rollback().await {
            tracing::warn!(error = %err, "rolling back dry run failed");
        }
        result
    }

    async fn lock(&mut self) -> Result<AdvisoryLock> {
        AdvisoryLock::acquire(&*self.client, self.config.resolved_lock_key()).await
    }

    /// Release the lock, keeping the first error.
    async fn unlock<T>(&mut self, lock: AdvisoryLock, result: Result<T>) -> Result<T> {
        match (lock.release(&*self.client).await, result) {
            (Ok(()), result) => result,
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(first)) => {
                tracing::warn!(error = %err, "releasing advisory lock failed");
                Err(first)
            }
        }
    }

    /// Create the ledger table and read it back.
    async fn prepare_ledger(&mut self) -> Result<Vec<AppliedMigration>> {
        let ledger = PgLedger::new(&*self.client, &self.config.ledger_table);
        ledger.ensure_table().await?;
        ledger.applied().await
    }
}

/// Open a migration transaction with the statement timeout applied.
async fn begin(client: &mut Client, timeout: Option<Duration>) -> Result<Transaction<'_>> {
    let tx = client.transaction().await?;
    if let Some(timeout) = timeout {
        tx.traced()
            .batch_execute(&format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis()
            ))
            .await?;
    }
    Ok(tx)
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction<'_>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

/// A pending migration must not be older than any applied one.
fn check_order(
    migrations: &[Box<dyn Migration>],
    applied: &[AppliedMigration],
) -> Result<()> {
    let newest_applied = migrations
        .iter()
        .filter(|m| applied.iter().any(|a| a.name == m.name()))
        .max_by_key(|m| m.version());
    let Some(newest_applied) = newest_applied else {
        return Ok(());
    };

    for migration in migrations {
        let is_applied = applied.iter().any(|a| a.name == migration.name());
        if !is_applied && migration.version() < newest_applied.version() {
            return Err(Error::OutOfOrder {
                pending: migration.name().to_string(),
                applied: newest_applied.name().to_string(),
            });
        }
    }
    Ok(())
}

fn log_report(report: &MigrationReport) {
    let duration_ms = report.duration.as_millis() as u64;
    match &report.outcome {
        MigrationOutcome::Failed(err) => tracing::error!(
            migration = %report.name,
            version = report.version,
            outcome = report.outcome.label(),
            duration_ms,
            error = %err,
            "migration failed"
        ),
        MigrationOutcome::Applied {
            state,
            operations_run,
            operations_skipped,
        } => tracing::info!(
            migration = %report.name,
            version = report.version,
            outcome = report.outcome.label(),
            state,
            operations_run,
            operations_skipped,
            duration_ms,
            "migration applied"
        ),
        MigrationOutcome::SkippedAlreadyInTargetShape { state } => tracing::info!(
            migration = %report.name,
            version = report.version,
            outcome = report.outcome.label(),
            state,
            duration_ms,
            "schema already in target shape"
        ),
        MigrationOutcome::SkippedAlreadyApplied => tracing::info!(
            migration = %report.name,
            version = report.version,
            outcome = report.outcome.label(),
            duration_ms,
            "already applied"
        ),
    }
}
