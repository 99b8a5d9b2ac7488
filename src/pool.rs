//! Traced connection pool.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::client::{CommandTag, PgPool, Value};
use crate::config::{TracingConfig, TracingOption};
use crate::connection::{Executor, TracedConn};
use crate::context::QueryContext;
use crate::error::{Error, TransactionError};
use crate::rows::{TracedRow, TracedRows};
use crate::sink::{Tracer, TracingTracer};
use crate::trace::QueryTracer;
use crate::tx::{TracedTx, TxOptions};

/// A pool whose connections are wrapped in [`TracedConn`].
///
/// One-shot calls acquire a connection, run the statement on it and return it
/// to the pool when the call finishes. Rows and single-row results keep their
/// connection until they are closed, scanned or dropped, and transactions
/// until the transaction value is dropped.
pub struct TracedPool<P> {
    pool: P,
    tracer: QueryTracer,
}

impl<P> std::fmt::Debug for TracedPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedPool")
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl<P: PgPool> TracedPool<P> {
    pub fn new(pool: P, config: TracingConfig) -> Self {
        Self::with_tracer(pool, config, Arc::new(TracingTracer::default()))
    }

    pub fn with_options<I>(pool: P, options: I) -> Self
    where
        I: IntoIterator<Item = TracingOption>,
    {
        Self::new(pool, TracingConfig::resolve(options))
    }

    pub fn with_tracer(pool: P, config: TracingConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            pool,
            tracer: QueryTracer::new(config, tracer),
        }
    }

    /// Get a reference to the underlying pool.
    pub fn inner(&self) -> &P {
        &self.pool
    }

    pub fn config(&self) -> &TracingConfig {
        self.tracer.config()
    }

    /// Acquire a traced connection. It returns to the pool when dropped.
    pub async fn acquire(&self, ctx: &QueryContext) -> Result<TracedConn<P::Client>, Error> {
        let client = self.pool.acquire(ctx).await?;
        Ok(TracedConn::from_parts(client, self.tracer.clone()))
    }

    pub async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error> {
        self.acquire(ctx).await?.exec(ctx, sql, params).await
    }

    pub async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<TracedRows, Error> {
        let conn = self.acquire(ctx).await?;
        let rows = conn.query(ctx, sql, params).await?;
        Ok(rows.with_lease(conn))
    }

    pub async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> TracedRow {
        match self.acquire(ctx).await {
            Ok(conn) => {
                let row = conn.query_row(ctx, sql, params).await;
                row.with_lease(conn)
            }
            Err(err) => TracedRow::closed(err),
        }
    }

    pub async fn ping(&self, ctx: &QueryContext) -> Result<(), Error> {
        self.acquire(ctx).await?.ping(ctx).await
    }

    pub async fn begin(&self, ctx: &QueryContext) -> Result<TracedTx<P::Client>, Error> {
        self.begin_tx(ctx, &TxOptions::default()).await
    }

    pub async fn begin_tx(
        &self,
        ctx: &QueryContext,
        options: &TxOptions,
    ) -> Result<TracedTx<P::Client>, Error> {
        self.acquire(ctx).await?.begin_tx(ctx, options).await
    }

    pub async fn begin_func<F, T, E>(
        &self,
        ctx: &QueryContext,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'t> FnOnce(&'t TracedTx<P::Client>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.begin_tx_func(ctx, &TxOptions::default(), f).await
    }

    pub async fn begin_tx_func<F, T, E>(
        &self,
        ctx: &QueryContext,
        options: &TxOptions,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'t> FnOnce(&'t TracedTx<P::Client>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        let conn = self
            .acquire(ctx)
            .await
            .map_err(TransactionError::Connection)?;
        conn.begin_tx_func(ctx, options, f).await
    }

    /// Close the pool. Not traced.
    pub fn close(&self) {
        self.pool.close();
    }
}
