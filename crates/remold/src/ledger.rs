//! Migration ledger.
//!
//! One row per applied migration, written by the executor inside the same
//! transaction as the schema change it records.

use chrono::{DateTime, Utc};

use crate::traced::{Connection, ConnectionExt};
use crate::{BoxFuture, Result, quote_ident};

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    /// Ordering key, stored in the `timestamp` column.
    pub version: i64,
    pub applied_at: DateTime<Utc>,
}

/// Durable record of applied migrations.
pub trait Ledger: Send + Sync {
    fn is_applied<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Record `name` as applied. Recording a name twice is a no-op.
    fn mark_applied<'a>(&'a self, name: &'a str, version: i64) -> BoxFuture<'a, Result<()>>;

    /// Delete the record for `name`. Returns whether a row was removed.
    fn unmark<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Every record, ordered by ordering key.
    fn applied(&self) -> BoxFuture<'_, Result<Vec<AppliedMigration>>>;
}

/// [`Ledger`] stored in a Postgres table.
pub struct PgLedger<'c, C: Connection + ?Sized> {
    conn: &'c C,
    table: String,
}

impl<'c, C: Connection + ?Sized> PgLedger<'c, C> {
    pub fn new(conn: &'c C, table: &str) -> Self {
        Self {
            conn,
            table: quote_ident(table),
        }
    }

    /// Create the ledger table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20   id SERIAL PRIMARY KEY,\n\
             \x20   \"timestamp\" BIGINT NOT NULL,\n\
             \x20   name VARCHAR NOT NULL UNIQUE,\n\
             \x20   applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
             )",
            self.table
        );
        self.conn.traced().batch_execute(&sql).await?;
        Ok(())
    }
}

impl<C: Connection + ?Sized> Ledger for PgLedger<'_, C> {
    fn is_applied<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE name = $1)",
                self.table
            );
            let row = self.conn.traced().query_one(&sql, &[&name]).await?;
            Ok(row.try_get::<_, bool>(0)?)
        })
    }

    fn mark_applied<'a>(&'a self, name: &'a str, version: i64) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {} (\"timestamp\", name) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
                self.table
            );
            self.conn.traced().execute(&sql, &[&version, &name]).await?;
            Ok(())
        })
    }

    fn unmark<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE name = $1", self.table);
            let deleted = self.conn.traced().execute(&sql, &[&name]).await?;
            Ok(deleted > 0)
        })
    }

    fn applied(&self) -> BoxFuture<'_, Result<Vec<AppliedMigration>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT name, \"timestamp\", applied_at FROM {} ORDER BY \"timestamp\", id",
                self.table
            );
            let rows = self.conn.traced().query(&sql, &[]).await?;
            rows.iter()
                .map(|row| {
                    Ok(AppliedMigration {
                        name: row.try_get(0)?,
                        version: row.try_get(1)?,
                        applied_at: row.try_get(2)?,
                    })
                })
                .collect()
        })
    }
}
