// Transactions - managed and unmanaged, with explicit context passing

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::{Sqlite, SqliteConnection, Transaction};

use crate::error::{OrmError, OrmResult};

/// Requested isolation level, forwarded to the engine. The engine is the
/// sole arbiter of lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    pub isolation: Option<IsolationLevel>,
    /// Deadline for unmanaged transactions; the configured default applies
    /// when unset.
    pub timeout: Option<Duration>,
}

/// An open transaction. Operations bound to it execute serially through its
/// connection; dropping an unresolved transaction rolls it back.
pub struct Txn {
    tx: Transaction<'static, Sqlite>,
    deadline: Option<Instant>,
}

impl Txn {
    pub(crate) async fn open(
        pool: &sqlx::SqlitePool,
        isolation: IsolationLevel,
        timeout: Option<Duration>,
    ) -> OrmResult<Self> {
        let mut tx = pool.begin().await?;
        match isolation {
            IsolationLevel::ReadUncommitted => {
                sqlx::query("PRAGMA read_uncommitted = true")
                    .execute(&mut *tx)
                    .await?;
            }
            other => {
                // SQLite serializes transactions; stronger requests are
                // already satisfied.
                tracing::debug!("isolation {:?} satisfied by engine default", other);
            }
        }
        Ok(Self {
            tx,
            deadline: timeout.map(|t| Instant::now() + t),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Connection handle for statements that must join this transaction.
    pub(crate) fn conn(&mut self) -> OrmResult<&mut SqliteConnection> {
        if self.is_expired() {
            return Err(OrmError::TxnExpired);
        }
        Ok(&mut self.tx)
    }

    pub async fn commit(self) -> OrmResult<()> {
        if self.is_expired() {
            self.tx.rollback().await?;
            return Err(OrmError::TxnExpired);
        }
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> OrmResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn").field("deadline", &self.deadline).finish()
    }
}
