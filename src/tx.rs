//! Traced transactions.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sea_orm::{AccessMode, IsolationLevel};
use tracing::{error, warn};

use crate::batch::TracedBatchResults;
use crate::client::{
    Batch, CommandTag, CopyFromSource, PgClient, StatementDescription, TxStatus, Value,
};
use crate::connection::{Executor, TracedConn};
use crate::context::QueryContext;
use crate::error::{Error, TransactionError};
use crate::parser::{Identifier, QueryKind};
use crate::rows::{TracedRow, TracedRows};
use crate::savepoint::Savepoint;

/// Whether a serializable read-only transaction may block to run without
/// serialization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferrableMode {
    Deferrable,
    NotDeferrable,
}

impl DeferrableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferrableMode::Deferrable => "deferrable",
            DeferrableMode::NotDeferrable => "not deferrable",
        }
    }
}

impl std::fmt::Display for DeferrableMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options rendered into the `begin` statement.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
    pub deferrable_mode: Option<DeferrableMode>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = Some(mode);
        self
    }

    pub fn with_deferrable_mode(mut self, mode: DeferrableMode) -> Self {
        self.deferrable_mode = Some(mode);
        self
    }

    /// The statement that starts a transaction with these options.
    pub fn begin_sql(&self) -> String {
        let mut sql = String::from("begin");
        if let Some(level) = &self.isolation_level {
            sql.push_str(" isolation level ");
            sql.push_str(&level.to_string().to_lowercase());
        }
        if let Some(mode) = &self.access_mode {
            sql.push(' ');
            sql.push_str(&mode.to_string().to_lowercase());
        }
        if let Some(mode) = self.deferrable_mode {
            sql.push(' ');
            sql.push_str(mode.as_str());
        }
        sql
    }
}

#[derive(Debug, Default)]
struct TxState {
    closed: AtomicBool,
    savepoint_num: AtomicI64,
}

/// Operations shared by transactions and savepoints.
#[async_trait]
pub trait Transaction: Executor {
    type Client: PgClient + 'static;

    /// Start a pseudo nested transaction backed by a savepoint.
    async fn begin(&self, ctx: &QueryContext) -> Result<Savepoint<Self::Client>, Error>;

    async fn commit(&self, ctx: &QueryContext) -> Result<(), Error>;

    async fn rollback(&self, ctx: &QueryContext) -> Result<(), Error>;

    /// Whether commit or rollback has already run.
    fn is_closed(&self) -> bool;

    /// The connection the transaction runs on.
    fn conn(&self) -> &TracedConn<Self::Client>;

    /// Large object access. Not supported through the tracing layer.
    fn large_objects(&self) -> LargeObjects {
        warn!("Large objects requested on a traced transaction; they are not available");
        LargeObjects { _private: () }
    }

    /// Run `f` inside a savepoint, releasing it when `f` returns `Ok` and
    /// rolling back to it when `f` returns `Err` or panics.
    async fn begin_func<F, T, E>(
        &self,
        ctx: &QueryContext,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        Self: Sized,
        F: for<'t> FnOnce(&'t Savepoint<Self::Client>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        if self.is_closed() {
            return Err(TransactionError::Connection(Error::TxClosed));
        }
        let savepoint = self.begin(ctx).await.map_err(TransactionError::Connection)?;
        run_in_transaction(&savepoint, ctx, f).await
    }
}

/// Run `f` against `tx`, then commit or roll back.
///
/// A rollback that finds the transaction already closed is ignored; any other
/// rollback failure replaces the unit of work's error. Panics roll back and
/// then resume.
pub(crate) async fn run_in_transaction<X, F, T, E>(
    tx: &X,
    ctx: &QueryContext,
    f: F,
) -> Result<T, TransactionError<E>>
where
    X: Transaction,
    F: for<'t> FnOnce(&'t X) -> BoxFuture<'t, Result<T, E>> + Send,
    T: Send,
    E: Send,
{
    // `f` runs inside the guard so panics raised while building the future are caught too
    let unit_of_work = async move { f(tx).await };
    match AssertUnwindSafe(unit_of_work).catch_unwind().await {
        Ok(Ok(value)) => {
            tx.commit(ctx)
                .await
                .map_err(TransactionError::Connection)?;
            Ok(value)
        }
        Ok(Err(err)) => match tx.rollback(ctx).await {
            Ok(()) => Err(TransactionError::Transaction(err)),
            Err(Error::TxClosed) => Err(TransactionError::Transaction(err)),
            Err(rollback_err) => Err(TransactionError::Connection(rollback_err)),
        },
        Err(panic) => {
            if let Err(err) = tx.rollback(ctx).await {
                if !err.is_tx_closed() {
                    warn!(error = %err, "Rollback after panic failed");
                }
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// A transaction on a traced connection.
///
/// Statements run through the connection and are traced there. Once
/// [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback) has
/// been called every further operation fails with [`Error::TxClosed`] without
/// reaching the server or emitting a span.
pub struct TracedTx<C> {
    conn: TracedConn<C>,
    state: Arc<TxState>,
}

impl<C> std::fmt::Debug for TracedTx<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedTx")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<C: PgClient + 'static> TracedTx<C> {
    pub(crate) fn new(conn: TracedConn<C>) -> Self {
        Self {
            conn,
            state: Arc::new(TxState::default()),
        }
    }

    /// Another handle to the same transaction, used by its savepoints.
    pub(crate) fn share(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.state.closed.load(Ordering::SeqCst) {
            Err(Error::TxClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<C: PgClient + 'static> Transaction for TracedTx<C> {
    type Client = C;

    async fn begin(&self, ctx: &QueryContext) -> Result<Savepoint<C>, Error> {
        self.ensure_open()?;
        let savepoint_num = self.state.savepoint_num.fetch_add(1, Ordering::SeqCst) + 1;
        self.conn
            .exec(ctx, &format!("savepoint sp_{}", savepoint_num), &[])
            .await?;
        Ok(Savepoint::new(self.share(), savepoint_num))
    }

    async fn commit(&self, ctx: &QueryContext) -> Result<(), Error> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::TxClosed);
        }

        match self.conn.exec_as(ctx, QueryKind::Commit, "commit", &[]).await {
            Ok(tag) if tag.as_str() == "ROLLBACK" => Err(Error::TxCommitRollback),
            Ok(_) => Ok(()),
            Err(err) => {
                if self.conn.tx_status() != TxStatus::Idle {
                    warn!(error = %err, "Commit failed inside a transaction block, closing connection");
                    // the connection is unusable either way
                    let _ = self.conn.client().close(ctx).await;
                }
                Err(err)
            }
        }
    }

    async fn rollback(&self, ctx: &QueryContext) -> Result<(), Error> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::TxClosed);
        }

        let result = self
            .conn
            .exec_as(ctx, QueryKind::Rollback, "rollback", &[])
            .await;
        if let Err(err) = &result {
            error!(error = %err, "Rollback failed, connection will be torn down");
            self.conn.die(Error::RollbackFailed(Box::new(err.clone())));
        }
        result.map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn conn(&self) -> &TracedConn<C> {
        &self.conn
    }
}

#[async_trait]
impl<C: PgClient + 'static> Executor for TracedTx<C> {
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error> {
        self.ensure_open()?;
        self.conn.exec(ctx, sql, params).await
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<TracedRows, Error> {
        self.ensure_open()?;
        self.conn.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> TracedRow {
        if let Err(err) = self.ensure_open() {
            return TracedRow::closed(err);
        }
        self.conn.query_row(ctx, sql, params).await
    }

    async fn query_func(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
        f: &mut (dyn for<'r> FnMut(&'r [Value]) -> Result<(), Error> + Send),
    ) -> Result<CommandTag, Error> {
        self.ensure_open()?;
        self.conn.query_func(ctx, sql, params, f).await
    }

    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error> {
        self.ensure_open()?;
        self.conn.copy_from(ctx, table, columns, source).await
    }

    async fn send_batch(&self, ctx: &QueryContext, batch: Batch) -> TracedBatchResults {
        if let Err(err) = self.ensure_open() {
            return TracedBatchResults::closed(err);
        }
        self.conn.send_batch(ctx, batch).await
    }

    async fn prepare(
        &self,
        ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error> {
        self.ensure_open()?;
        self.conn.prepare(ctx, name, sql).await
    }
}

/// Large object manager of a traced transaction.
///
/// Every operation fails with [`Error::LargeObjectsUnavailable`].
#[derive(Debug)]
pub struct LargeObjects {
    _private: (),
}

impl LargeObjects {
    /// Create a large object, returning its OID.
    pub async fn create(&self, _ctx: &QueryContext, _oid: u32) -> Result<u32, Error> {
        Err(Error::LargeObjectsUnavailable)
    }

    pub async fn unlink(&self, _ctx: &QueryContext, _oid: u32) -> Result<(), Error> {
        Err(Error::LargeObjectsUnavailable)
    }
}
