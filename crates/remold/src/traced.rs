//! Traced database connection wrapper.
//!
//! Wraps a tokio-postgres client or transaction and logs every statement via
//! tracing. The engine only ever talks to Postgres through this module.

use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::Instrument;

use crate::BoxFuture;

/// A wrapper around a database connection that logs all queries via tracing.
///
/// # Example
///
/// ```ignore
/// use remold::ConnectionExt;
///
/// let tx = client.transaction().await?;
/// let traced = tx.traced();
/// traced.execute("ALTER TABLE a RENAME TO b", &[]).await?;
/// ```
pub struct TracedConn<'a, C: Connection + ?Sized> {
    conn: &'a C,
}

impl<'a, C: Connection + ?Sized> TracedConn<'a, C> {
    /// Create a new traced connection wrapper.
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            params = params.len(),
            affected = tracing::field::Empty,
        );
        let affected = self
            .conn
            .execute(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("affected", affected);
        Ok(affected)
    }

    /// Execute one or more statements without parameters.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.batch_execute", sql = %sql);
        self.conn.batch_execute(sql).instrument(span).await
    }

    /// Execute a query, returning all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let rows = self
            .conn
            .query(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Execute a query, returning exactly one row.
    ///
    /// Returns an error if the query returns zero or more than one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = 1u64,
        );
        self.conn.query_one(sql, params).instrument(span).await
    }
}

/// Extension trait to get a traced wrapper from a connection.
pub trait ConnectionExt: Connection {
    /// Wrap this connection in a `TracedConn` for query logging.
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}

/// Trait for database connections that can execute queries.
///
/// This is implemented for `tokio_postgres::Client` (session-level work such as
/// advisory locks) and `tokio_postgres::Transaction` (everything a migration
/// touches).
pub trait Connection: Send + Sync {
    /// Execute a statement, returning the number of rows affected.
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<u64, Error>>;

    /// Execute one or more statements without parameters.
    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Execute a query, returning all rows.
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Vec<Row>, Error>>;

    /// Execute a query, returning exactly one row.
    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Row, Error>>;
}

impl Connection for tokio_postgres::Client {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(tokio_postgres::Client::execute(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(tokio_postgres::Client::batch_execute(self, sql))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Box::pin(tokio_postgres::Client::query(self, sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Row, Error>> {
        Box::pin(tokio_postgres::Client::query_one(self, sql, params))
    }
}

impl Connection for tokio_postgres::Transaction<'_> {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(tokio_postgres::Transaction::execute(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(tokio_postgres::Transaction::batch_execute(self, sql))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Box::pin(tokio_postgres::Transaction::query(self, sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Result<Row, Error>> {
        Box::pin(tokio_postgres::Transaction::query_one(self, sql, params))
    }
}
