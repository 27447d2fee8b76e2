//! Read-only catalog inspection.
//!
//! Every probe is scoped to `current_schema()` and answers "not found" with
//! `false`; only infrastructure failures surface as errors. Probes must run on
//! the same transaction as the writes that follow them, so the classification
//! they feed reflects one consistent snapshot.

use tokio_postgres::types::ToSql;

use crate::traced::{Connection, ConnectionExt};
use crate::{BoxFuture, Result, quote_ident};

/// Read-only questions the engine asks about the live schema.
pub trait Catalog: Send + Sync {
    /// Whether a regular or partitioned table with this name exists.
    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Whether `table` has a live (not dropped) column named `column`.
    fn column_exists<'a>(&'a self, table: &'a str, column: &'a str)
    -> BoxFuture<'a, Result<bool>>;

    /// Whether an index with this name exists.
    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Whether `table` carries a constraint named `constraint`.
    fn constraint_exists<'a>(
        &'a self,
        table: &'a str,
        constraint: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Whether an enum type with this name exists.
    fn enum_type_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Columns (as `table.column`) whose type is the given enum type.
    fn enum_type_dependents<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Number of rows in `table`.
    fn row_count<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<i64>>;

    /// Number of rows in `table` where `column` is NULL.
    fn null_count<'a>(&'a self, table: &'a str, column: &'a str) -> BoxFuture<'a, Result<i64>>;
}

const TABLE_EXISTS: &str = "\
SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = current_schema() AND c.relname = $1 AND c.relkind IN ('r', 'p')
)";

const COLUMN_EXISTS: &str = "\
SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = current_schema() AND c.relname = $1 AND a.attname = $2
      AND a.attnum > 0 AND NOT a.attisdropped
)";

const INDEX_EXISTS: &str = "\
SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = current_schema() AND c.relname = $1 AND c.relkind IN ('i', 'I')
)";

const CONSTRAINT_EXISTS: &str = "\
SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = rel.relnamespace
    WHERE n.nspname = current_schema() AND rel.relname = $1 AND con.conname = $2
)";

const ENUM_TYPE_EXISTS: &str = "\
SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_type t
    JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
    WHERE n.nspname = current_schema() AND t.typname = $1 AND t.typtype = 'e'
)";

const ENUM_TYPE_DEPENDENTS: &str = "\
SELECT c.relname::text || '.' || a.attname::text
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
WHERE n.nspname = current_schema() AND t.typname = $1
  AND a.attnum > 0 AND NOT a.attisdropped AND c.relkind IN ('r', 'p')
ORDER BY 1";

/// [`Catalog`] backed by `pg_catalog` queries on a live connection.
pub struct PgCatalog<'c, C: Connection + ?Sized> {
    conn: &'c C,
}

impl<'c, C: Connection + ?Sized> PgCatalog<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }

    async fn exists(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<bool> {
        let row = self.conn.traced().query_one(sql, params).await?;
        Ok(row.try_get::<_, bool>(0)?)
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        let row = self.conn.traced().query_one(sql, &[]).await?;
        Ok(row.try_get::<_, i64>(0)?)
    }
}

impl<C: Connection + ?Sized> Catalog for PgCatalog<'_, C> {
    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.exists(TABLE_EXISTS, &[&table]).await })
    }

    fn column_exists<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.exists(COLUMN_EXISTS, &[&table, &column]).await })
    }

    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.exists(INDEX_EXISTS, &[&index]).await })
    }

    fn constraint_exists<'a>(
        &'a self,
        table: &'a str,
        constraint: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.exists(CONSTRAINT_EXISTS, &[&table, &constraint]).await })
    }

    fn enum_type_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.exists(ENUM_TYPE_EXISTS, &[&name]).await })
    }

    fn enum_type_dependents<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .traced()
                .query(ENUM_TYPE_DEPENDENTS, &[&name])
                .await?;
            rows.iter()
                .map(|row| row.try_get::<_, String>(0).map_err(Into::into))
                .collect()
        })
    }

    fn row_count<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            self.count(&format!("SELECT count(*) FROM {}", quote_ident(table)))
                .await
        })
    }

    fn null_count<'a>(&'a self, table: &'a str, column: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            self.count(&format!(
                "SELECT count(*) FROM {} WHERE {} IS NULL",
                quote_ident(table),
                quote_ident(column)
            ))
            .await
        })
    }
}
