//! Session-level advisory lock serializing concurrent runners.

use crate::Result;
use crate::traced::{Connection, ConnectionExt};

/// Derive the advisory lock key for a ledger table.
///
/// Runners that share a ledger share a key. The key is the first eight bytes
/// of the blake3 hash of the table name, read as a little-endian `i64`.
pub fn lock_key(ledger_table: &str) -> i64 {
    let hash = blake3::hash(ledger_table.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// A held `pg_advisory_lock`.
///
/// The lock belongs to the database session, not to a transaction, so it must
/// be taken and released on the same connection outside any transaction.
/// Dropping the guard does not release it; call [`AdvisoryLock::release`].
#[must_use = "the lock is held until `release` is called or the session ends"]
#[derive(Debug)]
pub struct AdvisoryLock {
    key: i64,
}

impl AdvisoryLock {
    /// Block until the lock is available.
    pub async fn acquire<C: Connection + ?Sized>(conn: &C, key: i64) -> Result<Self> {
        tracing::debug!(key, "waiting for advisory lock");
        conn.traced()
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .await?;
        tracing::debug!(key, "advisory lock acquired");
        Ok(Self { key })
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release<C: Connection + ?Sized>(self, conn: &C) -> Result<()> {
        conn.traced()
            .execute("SELECT pg_advisory_unlock($1)", &[&self.key])
            .await?;
        tracing::debug!(key = self.key, "advisory lock released");
        Ok(())
    }
}
