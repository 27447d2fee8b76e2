//! Forward and reverse execution of one migration.
//!
//! Both directions run against a [`Session`]: the catalog, the ledger and the
//! statement sink of a single transaction. The caller owns the transaction;
//! returning an error means it must roll back.

use crate::classify::{Action, Classification, StateDescriptor, TargetState, classify};
use crate::ledger::PgLedger;
use crate::traced::{Connection, ConnectionExt};
use crate::{
    AppliedMigration, BoxFuture, Catalog, Error, Ledger, Migration, Operation, PgCatalog, Result,
};

/// Everything the executor needs from one transaction.
pub trait Session: Catalog + Ledger {
    /// Run one statement, returning the number of rows it affected.
    fn run<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, Result<u64>>;
}

/// [`Session`] over a Postgres connection, normally a transaction.
pub struct PgSession<'c, C: Connection + ?Sized> {
    conn: &'c C,
    catalog: PgCatalog<'c, C>,
    ledger: PgLedger<'c, C>,
}

impl<'c, C: Connection + ?Sized> PgSession<'c, C> {
    pub fn new(conn: &'c C, ledger_table: &str) -> Self {
        Self {
            conn,
            catalog: PgCatalog::new(conn),
            ledger: PgLedger::new(conn, ledger_table),
        }
    }
}

impl<C: Connection + ?Sized> Catalog for PgSession<'_, C> {
    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.catalog.table_exists(table)
    }

    fn column_exists<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        self.catalog.column_exists(table, column)
    }

    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.catalog.index_exists(index)
    }

    fn constraint_exists<'a>(
        &'a self,
        table: &'a str,
        constraint: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        self.catalog.constraint_exists(table, constraint)
    }

    fn enum_type_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.catalog.enum_type_exists(name)
    }

    fn enum_type_dependents<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        self.catalog.enum_type_dependents(name)
    }

    fn row_count<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<i64>> {
        self.catalog.row_count(table)
    }

    fn null_count<'a>(&'a self, table: &'a str, column: &'a str) -> BoxFuture<'a, Result<i64>> {
        self.catalog.null_count(table, column)
    }
}

impl<C: Connection + ?Sized> Ledger for PgSession<'_, C> {
    fn is_applied<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.ledger.is_applied(name)
    }

    fn mark_applied<'a>(&'a self, name: &'a str, version: i64) -> BoxFuture<'a, Result<()>> {
        self.ledger.mark_applied(name, version)
    }

    fn unmark<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        self.ledger.unmark(name)
    }

    fn applied(&self) -> BoxFuture<'_, Result<Vec<AppliedMigration>>> {
        self.ledger.applied()
    }
}

impl<C: Connection + ?Sized> Session for PgSession<'_, C> {
    fn run<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let sql = op.to_sql();
            match op {
                // Hand-written statements may contain several commands.
                Operation::Sql { .. } => {
                    self.conn.traced().batch_execute(&sql).await?;
                    Ok(0)
                }
                _ => Ok(self.conn.traced().execute(&sql, &[]).await?),
            }
        })
    }
}

/// Outcome of [`apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The ledger already records the migration.
    AlreadyApplied,
    /// The schema already had the target shape; only the ledger row was written.
    AlreadyInTargetShape { state: &'static str },
    Applied {
        state: &'static str,
        operations_run: Vec<String>,
        operations_skipped: Vec<String>,
    },
}

/// Enum column rebuilt by a revert, with the rows that could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossyRestore {
    pub table: String,
    pub column: String,
    pub unresolved_rows: i64,
}

/// Outcome of [`revert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertReport {
    pub migration: String,
    pub state: &'static str,
    pub operations_run: Vec<String>,
    pub lossy: Vec<LossyRestore>,
}

impl RevertReport {
    pub fn is_lossy(&self) -> bool {
        self.lossy.iter().any(|l| l.unresolved_rows > 0)
    }
}

struct PlanRun {
    run: Vec<String>,
    skipped: Vec<String>,
    lossy: Vec<LossyRestore>,
}

/// Classify the schema against `states`, turning the non-plan outcomes into
/// errors where appropriate.
async fn recognize<'d, S: Session + ?Sized>(
    session: &S,
    migration: &str,
    states: &'d [StateDescriptor],
) -> Result<&'d StateDescriptor> {
    match classify(session, states).await? {
        Classification::Known(state) => match &state.action {
            Action::Ambiguous { detail } => Err(Error::AmbiguousState {
                migration: migration.to_string(),
                state: state.name.to_string(),
                detail: detail.clone(),
            }),
            _ => Ok(state),
        },
        Classification::Unknown(observed) => Err(Error::UnknownSchemaState {
            migration: migration.to_string(),
            observed: Classification::describe_observed(&observed),
        }),
    }
}

async fn run_plan<S: Session + ?Sized>(
    session: &S,
    migration: &str,
    state: &StateDescriptor,
) -> Result<PlanRun> {
    let mut plan = PlanRun {
        run: Vec::new(),
        skipped: Vec::new(),
        lossy: Vec::new(),
    };

    for op in state.operations() {
        let failed = |source: Error| Error::OperationFailed {
            migration: migration.to_string(),
            state: state.name.to_string(),
            operation: op.to_string(),
            source: Box::new(source),
        };

        if !op.is_pending(session).await.map_err(failed)? {
            tracing::debug!(migration, operation = %op, "already in desired state, skipping");
            plan.skipped.push(op.to_string());
            continue;
        }

        if let Operation::DropEnumType { name } = op {
            let dependents = session.enum_type_dependents(name).await.map_err(failed)?;
            if !dependents.is_empty() {
                return Err(failed(Error::IntegrityViolation {
                    object: name.clone(),
                    detail: format!("still used by {}", dependents.join(", ")),
                    source: None,
                }));
            }
        }

        let affected = session.run(op).await.map_err(failed)?;
        tracing::debug!(migration, operation = %op, affected, "ran operation");
        plan.run.push(op.to_string());

        if let Some((table, column)) = op.restores() {
            let unresolved_rows = session.null_count(table, column).await.map_err(failed)?;
            if unresolved_rows > 0 {
                tracing::warn!(
                    migration,
                    table,
                    column,
                    unresolved_rows,
                    "rows could not be mapped back to an enum literal and were left NULL"
                );
            }
            plan.lossy.push(LossyRestore {
                table: table.to_string(),
                column: column.to_string(),
                unresolved_rows,
            });
        }
    }

    Ok(plan)
}

async fn verify<S: Session + ?Sized>(
    session: &S,
    migration: &str,
    target: &TargetState,
) -> Result<()> {
    let unmet = target.unmet(session).await?;
    if unmet.is_empty() {
        return Ok(());
    }
    Err(Error::TargetNotReached {
        migration: migration.to_string(),
        unmet: unmet.iter().map(|c| c.to_string()).collect(),
    })
}

/// Apply `migration` forward inside the session's transaction.
pub async fn apply<S: Session + ?Sized>(
    session: &S,
    migration: &dyn Migration,
) -> Result<ApplyOutcome> {
    let name = migration.name();
    if session.is_applied(name).await? {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    let states = migration.forward();
    let state = recognize(session, name, &states).await?;
    tracing::debug!(migration = name, state = state.name, "classified schema");

    let outcome = match &state.action {
        Action::InTargetShape => ApplyOutcome::AlreadyInTargetShape { state: state.name },
        _ => {
            let plan = run_plan(session, name, state).await?;
            verify(session, name, &migration.target()).await?;
            ApplyOutcome::Applied {
                state: state.name,
                operations_run: plan.run,
                operations_skipped: plan.skipped,
            }
        }
    };

    session.mark_applied(name, migration.version()).await?;
    Ok(outcome)
}

/// Operations `apply` would run right now, without running them.
pub async fn preview<S: Session + ?Sized>(
    session: &S,
    migration: &dyn Migration,
) -> Result<(&'static str, Vec<Operation>)> {
    let states = migration.forward();
    let state = recognize(session, migration.name(), &states).await?;
    let mut pending = Vec::new();
    for op in state.operations() {
        if op.is_pending(session).await? {
            pending.push(op.clone());
        }
    }
    Ok((state.name, pending))
}

/// Revert `migration` inside the session's transaction and delete its ledger row.
///
/// Only the newest applied migration can be reverted; anything newer in the
/// ledger fails with [`Error::OutOfOrder`].
pub async fn revert<S: Session + ?Sized>(
    session: &S,
    migration: &dyn Migration,
) -> Result<RevertReport> {
    let name = migration.name();
    if !session.is_applied(name).await? {
        return Err(Error::NotApplied(name.to_string()));
    }

    // Later migrations may have reshaped what this one created.
    let newer = session
        .applied()
        .await?
        .into_iter()
        .filter(|a| a.version > migration.version())
        .max_by_key(|a| a.version);
    if let Some(newer) = newer {
        return Err(Error::OutOfOrder {
            pending: name.to_string(),
            applied: newer.name,
        });
    }

    let states = migration.reverse();
    let state = recognize(session, name, &states).await?;
    tracing::debug!(migration = name, state = state.name, "classified schema for revert");

    let plan = run_plan(session, name, state).await?;
    if matches!(state.action, Action::Plan(_)) {
        verify(session, name, &migration.reverse_target()).await?;
    }
    session.unmark(name).await?;

    Ok(RevertReport {
        migration: name.to_string(),
        state: state.name,
        operations_run: plan.run,
        lossy: plan.lossy,
    })
}
