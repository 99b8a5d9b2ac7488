//! Traced connection wrapper.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sea_orm::{AccessMode, IsolationLevel};

use crate::batch::TracedBatchResults;
use crate::client::{
    Batch, CommandTag, CopyFromSource, PgClient, StatementDescription, TxStatus, Value,
};
use crate::config::{TracingConfig, TracingOption};
use crate::context::QueryContext;
use crate::error::{Error, TransactionError};
use crate::parser::{classify, copy_from_resource, send_batch_resource, Identifier, QueryKind};
use crate::rows::{PendingTrace, TracedRow, TracedRows};
use crate::sink::{Tracer, TracingTracer};
use crate::trace::QueryTracer;
use crate::tx::{run_in_transaction, TracedTx, TxOptions};

/// Statement execution shared by connections, transactions and savepoints.
///
/// Transactions and savepoints forward these calls, after checking that they
/// are still open, to the connection that created them; the connection is the
/// only place where spans for statements are emitted.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a statement. Traced as `Exec`, or `Begin`/`Commit`/`Ping` by the
    /// statement text.
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error>;

    /// Run a query. Traced as `Query` when the call returns.
    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<TracedRows, Error>;

    /// Run a query expected to return one row. Traced when the row is scanned.
    async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> TracedRow;

    /// Run a query and hand every row to `f`, stopping at the first error.
    async fn query_func(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
        f: &mut (dyn for<'r> FnMut(&'r [Value]) -> Result<(), Error> + Send),
    ) -> Result<CommandTag, Error>;

    /// Bulk load rows into `table`. Traced as `CopyFrom`.
    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error>;

    /// Send a batch. Traced as `SendBatch` when the results are closed.
    async fn send_batch(&self, ctx: &QueryContext, batch: Batch) -> TracedBatchResults;

    /// Prepare a named statement. Traced as `Prepare`.
    async fn prepare(
        &self,
        ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error>;
}

/// A traced wrapper around a PostgreSQL client connection.
///
/// Every operation times the underlying call, classifies it, reports a span
/// and returns the client's result untouched. Transactions started here share
/// the connection and its configuration.
///
/// # Example
///
/// ```rust,ignore
/// use pg_tracing::prelude::*;
///
/// let conn = TracedConn::new(client, TracingConfig::new().with_service_name("orders-db"));
/// let ctx = QueryContext::new().with_span_tag("request_id", request_id);
///
/// let tx = conn.begin(&ctx).await?;
/// tx.exec(&ctx, "UPDATE orders SET state = $1 WHERE id = $2", &["paid".into(), id.into()]).await?;
/// tx.commit(&ctx).await?;
/// ```
pub struct TracedConn<C> {
    client: Arc<C>,
    tracer: QueryTracer,
}

impl<C> Clone for TracedConn<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            tracer: self.tracer.clone(),
        }
    }
}

impl<C> std::fmt::Debug for TracedConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedConn")
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl<C: PgClient + 'static> TracedConn<C> {
    /// Wrap `client`, reporting spans through the `tracing` crate.
    pub fn new(client: C, config: TracingConfig) -> Self {
        Self::with_tracer(client, config, Arc::new(TracingTracer::default()))
    }

    /// Wrap `client` with default configuration.
    pub fn wrap(client: C) -> Self {
        Self::new(client, TracingConfig::default())
    }

    /// Wrap `client`, resolving `options` on top of the defaults.
    pub fn with_options<I>(client: C, options: I) -> Self
    where
        I: IntoIterator<Item = TracingOption>,
    {
        Self::new(client, TracingConfig::resolve(options))
    }

    /// Wrap `client`, reporting spans to `tracer`.
    pub fn with_tracer(client: C, config: TracingConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self::from_parts(client, QueryTracer::new(config, tracer))
    }

    pub(crate) fn from_parts(client: C, tracer: QueryTracer) -> Self {
        Self {
            client: Arc::new(client),
            tracer,
        }
    }

    /// Get a reference to the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Get the tracing configuration.
    pub fn config(&self) -> &TracingConfig {
        self.tracer.config()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn tx_status(&self) -> TxStatus {
        self.client.tx_status()
    }

    /// Tear the connection down after an unrecoverable failure.
    pub(crate) fn die(&self, reason: Error) {
        self.client.die(reason);
    }

    /// Execute `sql` and trace it as `kind`, regardless of the statement text.
    pub(crate) async fn exec_as(
        &self,
        ctx: &QueryContext,
        kind: QueryKind,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error> {
        let start = SystemTime::now();
        let result = self.client.exec(ctx, sql, params).await;
        self.tracer
            .trace(ctx, kind, sql, start, None, result.as_ref().err());
        result
    }

    /// Check the connection is alive by executing an empty statement.
    pub async fn ping(&self, ctx: &QueryContext) -> Result<(), Error> {
        self.exec(ctx, ";", &[]).await.map(|_| ())
    }

    /// Close the connection. Traced as `Close`.
    pub async fn close(&self, ctx: &QueryContext) -> Result<(), Error> {
        let start = SystemTime::now();
        let result = self.client.close(ctx).await;
        self.tracer
            .trace(ctx, QueryKind::Close, "", start, None, result.as_ref().err());
        result
    }

    /// Release a prepared statement. Traced as `Deallocate`.
    pub async fn deallocate(&self, ctx: &QueryContext, name: &str) -> Result<(), Error> {
        let start = SystemTime::now();
        let result = self.client.deallocate(ctx, name).await;
        self.tracer.trace(
            ctx,
            QueryKind::Deallocate,
            &format!("DEALLOCATE {}", name),
            start,
            None,
            result.as_ref().err(),
        );
        result
    }

    /// Begin a transaction with default options.
    pub async fn begin(&self, ctx: &QueryContext) -> Result<TracedTx<C>, Error> {
        self.begin_tx(ctx, &TxOptions::default()).await
    }

    /// Begin a transaction. The `begin` statement is traced as `Begin`.
    pub async fn begin_tx(
        &self,
        ctx: &QueryContext,
        options: &TxOptions,
    ) -> Result<TracedTx<C>, Error> {
        self.exec(ctx, &options.begin_sql(), &[]).await?;
        Ok(TracedTx::new(self.clone()))
    }

    /// Begin a transaction using sea-orm's isolation level and access mode types.
    pub async fn begin_with_config(
        &self,
        ctx: &QueryContext,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<TracedTx<C>, Error> {
        let options = TxOptions {
            isolation_level,
            access_mode,
            deferrable_mode: None,
        };
        self.begin_tx(ctx, &options).await
    }

    /// Run `f` inside a transaction with default options.
    ///
    /// The transaction is committed when `f` returns `Ok`, and rolled back when
    /// it returns `Err` or panics.
    pub async fn begin_func<F, T, E>(
        &self,
        ctx: &QueryContext,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'t> FnOnce(&'t TracedTx<C>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.begin_tx_func(ctx, &TxOptions::default(), f).await
    }

    /// Run `f` inside a transaction started with `options`.
    pub async fn begin_tx_func<F, T, E>(
        &self,
        ctx: &QueryContext,
        options: &TxOptions,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'t> FnOnce(&'t TracedTx<C>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        let tx = self
            .begin_tx(ctx, options)
            .await
            .map_err(TransactionError::Connection)?;
        run_in_transaction(&tx, ctx, f).await
    }
}

#[async_trait]
impl<C: PgClient + 'static> Executor for TracedConn<C> {
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error> {
        self.exec_as(ctx, classify(QueryKind::Exec, sql), sql, params)
            .await
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<TracedRows, Error> {
        let start = SystemTime::now();
        let result = self.client.query(ctx, sql, params).await;
        self.tracer.trace(
            ctx,
            classify(QueryKind::Query, sql),
            sql,
            start,
            None,
            result.as_ref().err(),
        );
        result.map(TracedRows::new)
    }

    async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> TracedRow {
        let start = SystemTime::now();
        let row = self.client.query_row(ctx, sql, params).await;
        let trace = PendingTrace::new(
            self.tracer.clone(),
            ctx,
            classify(QueryKind::Query, sql),
            sql,
            start,
        );
        TracedRow::new(row, trace)
    }

    async fn query_func(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
        f: &mut (dyn for<'r> FnMut(&'r [Value]) -> Result<(), Error> + Send),
    ) -> Result<CommandTag, Error> {
        let mut rows = self.query(ctx, sql, params).await?;
        while rows.next().await {
            let handled = rows.values().and_then(|values| f(&values));
            if let Err(err) = handled {
                rows.close();
                return Err(err);
            }
        }
        rows.close();
        match rows.err() {
            Some(err) => Err(err),
            None => Ok(rows.command_tag()),
        }
    }

    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error> {
        let start = SystemTime::now();
        let result = self.client.copy_from(ctx, table, columns, source).await;
        self.tracer.trace(
            ctx,
            QueryKind::CopyFrom,
            &copy_from_resource(table),
            start,
            None,
            result.as_ref().err(),
        );
        result
    }

    async fn send_batch(&self, ctx: &QueryContext, batch: Batch) -> TracedBatchResults {
        let start = SystemTime::now();
        let batch_len = batch.len();
        let results = self.client.send_batch(ctx, batch).await;
        let trace = PendingTrace::new(
            self.tracer.clone(),
            ctx,
            QueryKind::SendBatch,
            send_batch_resource(batch_len),
            start,
        );
        TracedBatchResults::new(results, trace)
    }

    async fn prepare(
        &self,
        ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error> {
        let start = SystemTime::now();
        let result = self.client.prepare(ctx, name, sql).await;
        self.tracer
            .trace(ctx, QueryKind::Prepare, sql, start, None, result.as_ref().err());
        result
    }
}

/// Extension trait for easy wrapping of client connections.
pub trait TracingExt: PgClient + Sized + 'static {
    /// Wrap this connection with tracing instrumentation.
    fn with_tracing(self) -> TracedConn<Self>;

    /// Wrap this connection with custom tracing configuration.
    fn with_tracing_config(self, config: TracingConfig) -> TracedConn<Self>;
}

impl<C: PgClient + 'static> TracingExt for C {
    fn with_tracing(self) -> TracedConn<Self> {
        TracedConn::wrap(self)
    }

    fn with_tracing_config(self, config: TracingConfig) -> TracedConn<Self> {
        TracedConn::new(self, config)
    }
}
