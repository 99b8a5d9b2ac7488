//! Batch results proxies.

use async_trait::async_trait;

use crate::client::{BatchResults, CommandTag, Row, Rows};
use crate::error::Error;
use crate::rows::{ClosedRow, PendingTrace, TracedRow, TracedRows};

/// Results of `send_batch`.
///
/// One span covers the whole batch. It is emitted by [`close`](Self::close),
/// or without an error if the results are dropped unclosed, timed from the
/// `send_batch` call and tagged with the number of queued statements.
pub struct TracedBatchResults {
    results: Box<dyn BatchResults>,
    trace: Option<PendingTrace>,
}

impl TracedBatchResults {
    pub(crate) fn new(results: Box<dyn BatchResults>, trace: PendingTrace) -> Self {
        Self {
            results,
            trace: Some(trace),
        }
    }

    /// Results rejected before the batch was sent; every read returns `err`.
    pub(crate) fn closed(err: Error) -> Self {
        Self {
            results: Box::new(ClosedBatchResults::new(err)),
            trace: None,
        }
    }

    /// Read the next result as a command tag.
    pub async fn exec(&mut self) -> Result<CommandTag, Error> {
        self.results.exec().await
    }

    /// Read the next result as rows.
    pub async fn query(&mut self) -> Result<TracedRows, Error> {
        self.results.query().await.map(TracedRows::new)
    }

    /// Read the next result as a single row.
    pub async fn query_row(&mut self) -> TracedRow {
        TracedRow::untraced(self.results.query_row().await)
    }

    /// Close the results and emit the batch span.
    pub async fn close(self) -> Result<(), Error> {
        let Self { results, trace } = self;
        let result = results.close().await;
        if let Some(trace) = trace {
            trace.emit(result.as_ref().err());
        }
        result
    }
}

impl std::fmt::Debug for TracedBatchResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedBatchResults")
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

/// Placeholder results for a batch rejected before it was sent.
#[derive(Debug, Clone)]
pub struct ClosedBatchResults {
    err: Error,
}

impl ClosedBatchResults {
    pub fn new(err: Error) -> Self {
        Self { err }
    }
}

#[async_trait]
impl BatchResults for ClosedBatchResults {
    async fn exec(&mut self) -> Result<CommandTag, Error> {
        Err(self.err.clone())
    }

    async fn query(&mut self) -> Result<Box<dyn Rows>, Error> {
        Err(self.err.clone())
    }

    async fn query_row(&mut self) -> Box<dyn Row> {
        Box::new(ClosedRow::new(self.err.clone()))
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        Err(self.err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::Batch;
    use crate::config::TracingConfig;
    use crate::connection::{Executor, TracedConn};
    use crate::context::QueryContext;
    use crate::mock::{MockClient, MockTracer};

    fn batch_of(len: usize) -> Batch {
        let mut batch = Batch::new();
        for _ in 0..len {
            batch.queue("INSERT INTO audit VALUES ($1)", vec!["login".into()]);
        }
        batch
    }

    #[tokio::test]
    async fn test_dropped_results_emit_batch_span() {
        let tracer = MockTracer::new();
        let conn = TracedConn::with_tracer(
            MockClient::new(),
            TracingConfig::default(),
            Arc::new(tracer.clone()),
        );

        let mut results = conn.send_batch(&QueryContext::new(), batch_of(2)).await;
        results.exec().await.unwrap();
        assert!(tracer.finished_spans().is_empty());

        drop(results);
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].query_kind(), Some("SendBatch"));
        assert!(spans[0].error.is_none());
    }

    #[tokio::test]
    async fn test_closed_results_emit_once() {
        let tracer = MockTracer::new();
        let conn = TracedConn::with_tracer(
            MockClient::new(),
            TracingConfig::default(),
            Arc::new(tracer.clone()),
        );

        let results = conn.send_batch(&QueryContext::new(), batch_of(1)).await;
        results.close().await.unwrap();
        assert_eq!(tracer.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_batch_results_return_stored_error() {
        let mut results = TracedBatchResults::closed(Error::TxClosed);
        assert!(results.exec().await.unwrap_err().is_tx_closed());
        assert!(results.query().await.unwrap_err().is_tx_closed());
        assert!(results.query_row().await.scan().await.unwrap_err().is_tx_closed());
        assert!(results.close().await.unwrap_err().is_tx_closed());
    }
}
