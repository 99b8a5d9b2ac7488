//! Pseudo nested transactions backed by savepoints.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::batch::TracedBatchResults;
use crate::client::{Batch, CommandTag, CopyFromSource, PgClient, StatementDescription, Value};
use crate::connection::{Executor, TracedConn};
use crate::context::QueryContext;
use crate::error::Error;
use crate::parser::Identifier;
use crate::rows::{TracedRow, TracedRows};
use crate::tx::{TracedTx, Transaction};

/// A savepoint inside a [`TracedTx`], named `sp_N` after its position in the
/// transaction.
///
/// Statements, including the savepoint's own `release savepoint` and
/// `rollback to savepoint`, go through the parent transaction and are traced
/// there as ordinary statements. The savepoint is unusable once it has been
/// committed or rolled back, or once its parent has.
pub struct Savepoint<C> {
    tx: TracedTx<C>,
    savepoint_num: i64,
    closed: AtomicBool,
}

impl<C> std::fmt::Debug for Savepoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Savepoint")
            .field("savepoint_num", &self.savepoint_num)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<C: PgClient + 'static> Savepoint<C> {
    pub(crate) fn new(tx: TracedTx<C>, savepoint_num: i64) -> Self {
        Self {
            tx,
            savepoint_num,
            closed: AtomicBool::new(false),
        }
    }

    /// Savepoint name, `sp_1` for the first savepoint of a transaction.
    pub fn name(&self) -> String {
        format!("sp_{}", self.savepoint_num)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::TxClosed)
        } else {
            Ok(())
        }
    }

    fn close_once(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) || self.tx.is_closed() {
            Err(Error::TxClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<C: PgClient + 'static> Transaction for Savepoint<C> {
    type Client = C;

    async fn begin(&self, ctx: &QueryContext) -> Result<Savepoint<C>, Error> {
        self.ensure_open()?;
        self.tx.begin(ctx).await
    }

    /// Release the savepoint.
    async fn commit(&self, ctx: &QueryContext) -> Result<(), Error> {
        self.close_once()?;
        self.tx
            .exec(ctx, &format!("release savepoint {}", self.name()), &[])
            .await
            .map(|_| ())
    }

    /// Roll back to the savepoint. The parent transaction stays open.
    async fn rollback(&self, ctx: &QueryContext) -> Result<(), Error> {
        self.close_once()?;
        self.tx
            .exec(ctx, &format!("rollback to savepoint {}", self.name()), &[])
            .await
            .map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    fn conn(&self) -> &TracedConn<C> {
        self.tx.conn()
    }
}

#[async_trait]
impl<C: PgClient + 'static> Executor for Savepoint<C> {
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error> {
        self.ensure_open()?;
        self.tx.exec(ctx, sql, params).await
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<TracedRows, Error> {
        self.ensure_open()?;
        self.tx.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> TracedRow {
        if let Err(err) = self.ensure_open() {
            return TracedRow::closed(err);
        }
        self.tx.query_row(ctx, sql, params).await
    }

    async fn query_func(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
        f: &mut (dyn for<'r> FnMut(&'r [Value]) -> Result<(), Error> + Send),
    ) -> Result<CommandTag, Error> {
        self.ensure_open()?;
        self.tx.query_func(ctx, sql, params, f).await
    }

    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error> {
        self.ensure_open()?;
        self.tx.copy_from(ctx, table, columns, source).await
    }

    async fn send_batch(&self, ctx: &QueryContext, batch: Batch) -> TracedBatchResults {
        if let Err(err) = self.ensure_open() {
            return TracedBatchResults::closed(err);
        }
        self.tx.send_batch(ctx, batch).await
    }

    async fn prepare(
        &self,
        ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error> {
        self.ensure_open()?;
        self.tx.prepare(ctx, name, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CopyFromRows;
    use crate::config::TracingConfig;
    use crate::error::TransactionError;
    use crate::mock::{MockClient, MockTracer};
    use std::sync::Arc;

    fn traced(client: &MockClient, tracer: &MockTracer) -> TracedConn<MockClient> {
        TracedConn::with_tracer(client.clone(), TracingConfig::default(), Arc::new(tracer.clone()))
    }

    #[tokio::test]
    async fn test_savepoint_statements() {
        let client = MockClient::new();
        let tracer = MockTracer::new();
        let conn = traced(&client, &tracer);
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let sp = tx.begin(&ctx).await.unwrap();
        assert_eq!(sp.name(), "sp_1");
        sp.exec(&ctx, "UPDATE t SET a = 2", &[]).await.unwrap();
        sp.commit(&ctx).await.unwrap();
        assert!(sp.is_closed());
        assert!(!tx.is_closed());
        tx.commit(&ctx).await.unwrap();

        assert_eq!(
            client.statements(),
            vec!["begin", "savepoint sp_1", "UPDATE t SET a = 2", "release savepoint sp_1", "commit"]
        );
        let resources: Vec<_> = tracer
            .finished_spans()
            .iter()
            .map(|span| span.resource().unwrap_or_default().to_string())
            .collect();
        assert_eq!(resources[3], "release savepoint sp_1");
        assert_eq!(tracer.finished_spans()[3].query_kind(), Some("Exec"));
    }

    #[tokio::test]
    async fn test_nested_savepoints_share_numbering() {
        let client = MockClient::new();
        let conn = traced(&client, &MockTracer::new());
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let outer = tx.begin(&ctx).await.unwrap();
        let inner = outer.begin(&ctx).await.unwrap();
        assert_eq!(inner.name(), "sp_2");
        inner.rollback(&ctx).await.unwrap();
        outer.commit(&ctx).await.unwrap();

        assert_eq!(
            client.statements()[1..],
            [
                "savepoint sp_1",
                "savepoint sp_2",
                "rollback to savepoint sp_2",
                "release savepoint sp_1",
            ]
        );
    }

    async fn assert_rejects_everything(
        sp: &Savepoint<MockClient>,
        client: &MockClient,
        tracer: &MockTracer,
    ) {
        let ctx = QueryContext::new();
        let calls = client.call_count();
        let spans = tracer.finished_spans().len();

        assert!(sp.exec(&ctx, "SELECT 1", &[]).await.unwrap_err().is_tx_closed());
        assert!(sp.query(&ctx, "SELECT 1", &[]).await.unwrap_err().is_tx_closed());
        assert!(sp.query_row(&ctx, "SELECT 1", &[]).await.scan().await.unwrap_err().is_tx_closed());
        let mut seen = 0;
        let queried = sp
            .query_func(&ctx, "SELECT 1", &[], &mut |_: &[Value]| {
                seen += 1;
                Ok(())
            })
            .await;
        assert!(queried.unwrap_err().is_tx_closed());
        assert_eq!(seen, 0);
        let mut source = CopyFromRows::new(vec![vec![1.into()]]);
        let copied = sp
            .copy_from(&ctx, &Identifier::from("t"), &["a".to_string()], &mut source)
            .await;
        assert!(copied.unwrap_err().is_tx_closed());
        assert!(sp.send_batch(&ctx, Batch::new()).await.close().await.unwrap_err().is_tx_closed());
        assert!(sp.prepare(&ctx, "stmt", "SELECT 1").await.unwrap_err().is_tx_closed());
        assert!(sp.begin(&ctx).await.unwrap_err().is_tx_closed());
        let nested = sp
            .begin_func(&ctx, |_inner| Box::pin(async move { Ok::<(), Error>(()) }))
            .await;
        assert!(matches!(nested, Err(TransactionError::Connection(Error::TxClosed))));
        assert!(sp.commit(&ctx).await.unwrap_err().is_tx_closed());
        assert!(sp.rollback(&ctx).await.unwrap_err().is_tx_closed());

        assert_eq!(client.call_count(), calls);
        assert_eq!(tracer.finished_spans().len(), spans);
    }

    #[tokio::test]
    async fn test_closed_savepoint_rejects_operations() {
        let client = MockClient::new();
        let tracer = MockTracer::new();
        let conn = traced(&client, &tracer);
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let sp = tx.begin(&ctx).await.unwrap();
        sp.rollback(&ctx).await.unwrap();

        assert_rejects_everything(&sp, &client, &tracer).await;
        assert!(!tx.is_closed());
    }

    #[tokio::test]
    async fn test_parent_close_closes_savepoint() {
        let client = MockClient::new();
        let tracer = MockTracer::new();
        let conn = traced(&client, &tracer);
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let sp = tx.begin(&ctx).await.unwrap();
        tx.commit(&ctx).await.unwrap();

        assert!(sp.is_closed());
        assert_rejects_everything(&sp, &client, &tracer).await;
    }

    #[tokio::test]
    async fn test_parent_rollback_closes_savepoint() {
        let client = MockClient::new();
        let tracer = MockTracer::new();
        let conn = traced(&client, &tracer);
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let sp = tx.begin(&ctx).await.unwrap();
        tx.rollback(&ctx).await.unwrap();

        assert!(sp.is_closed());
        assert_rejects_everything(&sp, &client, &tracer).await;
    }

    #[tokio::test]
    async fn test_savepoint_begin_func_releases() {
        let client = MockClient::new();
        let conn = traced(&client, &MockTracer::new());
        let ctx = QueryContext::new();

        let tx = conn.begin(&ctx).await.unwrap();
        let sp = tx.begin(&ctx).await.unwrap();
        let count = sp
            .begin_func(&ctx, |inner| {
                Box::pin(async move {
                    let tag = inner.exec(&QueryContext::new(), "DELETE FROM t", &[]).await?;
                    Ok::<_, Error>(tag.rows_affected())
                })
            })
            .await;
        assert!(matches!(count, Ok(0)));

        assert_eq!(
            client.statements()[2..],
            ["savepoint sp_2", "DELETE FROM t", "release savepoint sp_2"]
        );
        assert!(!sp.is_closed());
    }
}
