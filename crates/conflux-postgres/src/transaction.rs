//! PostgreSQL transaction management.
//!
//! Besides the plain [`Transaction`] wrapper this module provides the scoping
//! used by every write path in the crate:
//!
//! - [`Session`] says where work runs: on a fresh pooled connection, or on a
//!   connection the caller already holds inside its own transaction.
//! - [`ScopedTransaction`] is the guard opened for one operation. On a pool
//!   session it owns a real `BEGIN`/`COMMIT`; on a caller transaction it is a
//!   `SAVEPOINT`, so a failed operation is undone without aborting the
//!   caller's transaction. Dropping the guard without committing rolls back.
//! - [`requires_transaction`] runs a closure in the caller's transaction when
//!   there is one and in a fresh, self-committing transaction otherwise.

use futures::future::BoxFuture;
use sqlx::{PgConnection, Postgres};
use tracing::{debug, warn};

use crate::{Connection, Result};

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted
    ReadUncommitted,
    /// Read committed (PostgreSQL default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// Returns the SQL isolation level string.
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Read-write transaction (default)
    #[default]
    ReadWrite,
    /// Read-only transaction - no writes allowed
    ReadOnly,
}

impl AccessMode {
    /// Returns the SQL access mode string.
    pub fn to_sql(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        }
    }
}

/// Transaction options applied when an operation opens its own transaction.
///
/// # Examples
///
/// ```rust,ignore
/// let options = TransactionOptions::new()
///     .isolation_level(IsolationLevel::RepeatableRead);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionOptions {
    /// Isolation level for the transaction
    pub isolation_level: IsolationLevel,
    /// Access mode (read-write or read-only)
    pub access_mode: AccessMode,
    /// Whether the transaction is deferrable (only meaningful for SERIALIZABLE READ ONLY)
    pub deferrable: bool,
}

impl TransactionOptions {
    /// Create new transaction options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Make the transaction read-only.
    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    /// Make the transaction read-write (default).
    pub fn read_write(mut self) -> Self {
        self.access_mode = AccessMode::ReadWrite;
        self
    }

    /// Set whether the transaction is deferrable.
    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    /// Build the SQL string for SET TRANSACTION command.
    pub fn to_sql(&self) -> String {
        let mut parts = vec![
            format!("ISOLATION LEVEL {}", self.isolation_level.to_sql()),
            self.access_mode.to_sql().to_string(),
        ];

        // DEFERRABLE is only valid for SERIALIZABLE READ ONLY
        if self.isolation_level == IsolationLevel::Serializable
            && self.access_mode == AccessMode::ReadOnly
        {
            if self.deferrable {
                parts.push("DEFERRABLE".to_string());
            } else {
                parts.push("NOT DEFERRABLE".to_string());
            }
        }

        format!("SET TRANSACTION {}", parts.join(", "))
    }
}

/// Represents an active database transaction started from the pool.
pub struct Transaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl Transaction {
    /// Borrows this transaction as a [`Session`] so bulk and single-record
    /// upserts join it instead of opening their own.
    pub fn session(&mut self) -> Session<'_> {
        Session::Transaction(&mut *self.tx)
    }

    /// Begins a new transaction with a specific isolation level.
    ///
    /// # Errors
    ///
    /// Returns error if transaction cannot be started.
    pub async fn begin(conn: &Connection, isolation_level: IsolationLevel) -> Result<Self> {
        let options = TransactionOptions::new().isolation_level(isolation_level);
        let mut tx = conn.pool().begin().await?;
        sqlx::query(&options.to_sql()).execute(&mut *tx).await?;

        debug!(isolation_level = ?options.isolation_level, "Started transaction");

        Ok(Self { tx })
    }

    /// Commits the transaction.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Rolls back the transaction.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Where an operation runs.
#[derive(Debug)]
pub enum Session<'c> {
    /// No caller transaction: the operation checks out its own connection
    /// and returns it to the pool when done.
    Pool(&'c Connection),
    /// A connection the caller holds, usually inside its own transaction.
    /// Its lifecycle stays with the caller.
    Transaction(&'c mut PgConnection),
}

/// Transaction guard for a single operation.
///
/// Owns a `BEGIN` when opened on [`Session::Pool`], otherwise a `SAVEPOINT`
/// inside the caller's transaction. Either way the inner sqlx transaction
/// rolls back on drop unless [`commit`](Self::commit) ran.
pub struct ScopedTransaction<'c> {
    tx: sqlx::Transaction<'c, Postgres>,
    owns_connection: bool,
}

impl std::fmt::Debug for ScopedTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedTransaction")
            .field("owns_connection", &self.owns_connection)
            .finish_non_exhaustive()
    }
}

impl<'c> ScopedTransaction<'c> {
    /// Opens the guard for `session`.
    pub async fn begin(session: Session<'c>, options: &TransactionOptions) -> Result<Self> {
        Ok(Self::open(session, options).await?)
    }

    /// Like [`begin`](Self::begin) but keeps the raw driver error, so the
    /// caller decides how it is formatted.
    pub(crate) async fn open(
        session: Session<'c>,
        options: &TransactionOptions,
    ) -> std::result::Result<Self, sqlx::Error> {
        match session {
            Session::Pool(conn) => {
                let mut tx = conn.pool().begin().await?;
                sqlx::query(&options.to_sql()).execute(&mut *tx).await?;
                debug!(
                    isolation_level = ?options.isolation_level,
                    access_mode = ?options.access_mode,
                    "Started scoped transaction"
                );
                Ok(Self {
                    tx,
                    owns_connection: true,
                })
            }
            Session::Transaction(conn) => {
                // Isolation is fixed by the caller's transaction.
                let tx = sqlx::Connection::begin(conn).await?;
                debug!("Opened savepoint in caller transaction");
                Ok(Self {
                    tx,
                    owns_connection: false,
                })
            }
        }
    }

    /// True when this guard began the outermost transaction.
    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// The connection all work of this operation must run on.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    /// Commits the transaction, or releases the savepoint.
    pub async fn commit(self) -> Result<()> {
        Ok(self.commit_raw().await?)
    }

    pub(crate) async fn commit_raw(self) -> std::result::Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    /// Rolls back the transaction, or rolls back to the savepoint.
    ///
    /// A failing rollback is logged and swallowed: the error that caused the
    /// rollback is the one worth surfacing, and sqlx discards a broken
    /// connection instead of returning it to the pool.
    pub async fn rollback(self) {
        let owns_connection = self.owns_connection;
        if let Err(e) = self.tx.rollback().await {
            warn!(owns_connection, error = %e, "Rollback failed");
        }
    }
}

/// Runs `f` inside a transaction.
///
/// With a caller transaction, `f` runs directly on the caller's connection
/// and the caller decides the outcome. Otherwise a fresh transaction is
/// opened with `options`, committed when `f` returns `Ok` and rolled back
/// when it returns `Err`.
///
/// ```rust,ignore
/// let count = requires_transaction(Session::Pool(&conn), &TransactionOptions::default(), |c| {
///     Box::pin(async move {
///         let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM foos")
///             .fetch_one(&mut *c)
///             .await?;
///         Ok(n)
///     })
/// })
/// .await?;
/// ```
pub async fn requires_transaction<T, F>(
    session: Session<'_>,
    options: &TransactionOptions,
    f: F,
) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut PgConnection) -> BoxFuture<'t, Result<T>>,
{
    match session {
        Session::Transaction(conn) => f(conn).await,
        Session::Pool(pool) => {
            let mut scoped = ScopedTransaction::begin(Session::Pool(pool), options).await?;
            let outcome = f(scoped.conn()).await;
            match outcome {
                Ok(value) => {
                    scoped.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    scoped.rollback().await;
                    Err(e)
                }
            }
        }
    }
}
