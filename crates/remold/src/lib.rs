//! Idempotent schema reconciliation for Postgres.
//!
//! Migrations are hand-written, ordered schema transformations that must be
//! safe to re-run no matter how far a previous attempt got. Instead of nested
//! "does table X exist? else does column Y exist?" checks, every migration
//! enumerates the schema shapes it expects to find as [`StateDescriptor`]s.
//! The engine:
//!
//! 1. asks the ledger whether the migration was already applied,
//! 2. classifies the live schema against the migration's descriptors,
//! 3. runs the operation list attached to the matching state, skipping every
//!    [`Operation`] whose guard says it is already in its desired state,
//! 4. records the migration in the ledger inside the same transaction.
//!
//! A schema that matches no descriptor stops the batch instead of guessing.
//!
//! Run migrations with [`MigrationRunner`]:
//!
//! ```ignore
//! let mut runner = MigrationRunner::new(&mut client);
//! let batch = runner.run_all(&remold::registered()).await?;
//! if let Some(failed) = batch.failed() {
//!     eprintln!("{} failed", failed.name);
//! }
//! ```
//!
//! Shipped migrations register themselves with `inventory`; see
//! [`migrations`].

use std::future::Future;
use std::pin::Pin;

mod catalog;
pub mod classify;
mod entity;
mod error;
mod executor;
mod ledger;
mod lock;
mod migrate;
pub mod migrations;
mod ops;
mod runner;
#[cfg(any(test, feature = "simulate"))]
pub mod simulate;
mod traced;

pub use catalog::{Catalog, PgCatalog};
pub use classify::{Action, Classification, Condition, Probe, StateDescriptor, TargetState};
pub use entity::{DependentReference, EntityRename, ForeignKeyRef, SchemaEntity};
pub use error::Error;
pub use executor::{
    ApplyOutcome, LossyRestore, PgSession, RevertReport, Session, apply, preview, revert,
};
pub use ledger::{AppliedMigration, Ledger, PgLedger};
pub use lock::{AdvisoryLock, lock_key};
pub use migrate::{Migration, Registration, registered, validate_order};
pub use ops::{ColumnDef, Operation, ReferentialAction};
pub use runner::{
    BatchResult, MigrationOutcome, MigrationReport, MigrationRunner, MigrationStatus,
    PlannedMigration, RevertBatch, RunnerConfig,
};
pub use traced::{Connection, ConnectionExt, TracedConn};

// Re-export inventory for migration registration
pub use inventory;

/// Result type for remold operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed future returned by the connection, catalog and ledger seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Quote an identifier for use in generated SQL.
///
/// Always quotes, doubling any embedded `"`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in generated SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("product_components"), "\"product_components\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("HARDWARE"), "'HARDWARE'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
