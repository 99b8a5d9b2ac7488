//! Row and result-set proxies.

use std::any::Any;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::client::{CommandTag, FieldDescription, Row, Rows, Value};
use crate::context::QueryContext;
use crate::error::Error;
use crate::parser::QueryKind;
use crate::trace::QueryTracer;

/// A span whose call has started but whose outcome is observed later.
///
/// Fires exactly once: through [`emit`](Self::emit), or with no error when
/// dropped unfired.
#[derive(Debug)]
pub(crate) struct PendingTrace {
    tracer: QueryTracer,
    ctx: QueryContext,
    kind: QueryKind,
    query: String,
    start_time: SystemTime,
    fired: bool,
}

impl PendingTrace {
    pub(crate) fn new(
        tracer: QueryTracer,
        ctx: &QueryContext,
        kind: QueryKind,
        query: impl Into<String>,
        start_time: SystemTime,
    ) -> Self {
        Self {
            tracer,
            ctx: ctx.clone(),
            kind,
            query: query.into(),
            start_time,
            fired: false,
        }
    }

    pub(crate) fn emit(mut self, error: Option<&Error>) {
        self.fire(error);
    }

    fn fire(&mut self, error: Option<&Error>) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.tracer.trace(
            &self.ctx,
            self.kind,
            &self.query,
            self.start_time,
            None,
            error,
        );
    }
}

impl Drop for PendingTrace {
    fn drop(&mut self) {
        self.fire(None);
    }
}

/// Something that must outlive a result, such as the pooled connection it
/// was read from.
type Lease = Box<dyn Any + Send>;

/// Result of `query_row`.
///
/// The span for the query is emitted when the row is scanned, closed unread
/// or dropped, timed from the `query_row` call.
pub struct TracedRow {
    row: Box<dyn Row>,
    trace: Option<PendingTrace>,
    lease: Option<Lease>,
}

impl TracedRow {
    pub(crate) fn new(row: Box<dyn Row>, trace: PendingTrace) -> Self {
        Self {
            row,
            trace: Some(trace),
            lease: None,
        }
    }

    /// A row that is not traced, e.g. one read from batch results.
    pub(crate) fn untraced(row: Box<dyn Row>) -> Self {
        Self {
            row,
            trace: None,
            lease: None,
        }
    }

    /// A row rejected before execution; scanning returns `err`.
    pub(crate) fn closed(err: Error) -> Self {
        Self::untraced(Box::new(ClosedRow::new(err)))
    }

    /// Keep `lease` alive until the row is scanned or closed.
    pub(crate) fn with_lease(mut self, lease: impl Any + Send) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    /// Scan the row and emit the query span with the scan's outcome.
    pub async fn scan(self) -> Result<Vec<Value>, Error> {
        let Self { row, trace, lease } = self;
        let result = row.scan().await;
        if let Some(trace) = trace {
            trace.emit(result.as_ref().err());
        }
        drop(lease);
        result
    }

    /// Discard the row without reading it, emitting the query span.
    pub fn close(self) {
        let Self { trace, lease, .. } = self;
        if let Some(trace) = trace {
            trace.emit(None);
        }
        drop(lease);
    }
}

impl std::fmt::Debug for TracedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedRow")
            .field("trace", &self.trace)
            .field("leased", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of `query`. The query's span was emitted when the call returned,
/// so iteration only forwards to the underlying rows.
pub struct TracedRows {
    rows: Box<dyn Rows>,
    lease: Option<Lease>,
}

impl TracedRows {
    pub(crate) fn new(rows: Box<dyn Rows>) -> Self {
        Self { rows, lease: None }
    }

    /// Keep `lease` alive until the rows are closed or dropped.
    pub(crate) fn with_lease(mut self, lease: impl Any + Send) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    pub async fn next(&mut self) -> bool {
        self.rows.next().await
    }

    pub fn values(&self) -> Result<Vec<Value>, Error> {
        self.rows.values()
    }

    pub fn raw_values(&self) -> Vec<Option<Vec<u8>>> {
        self.rows.raw_values()
    }

    pub fn field_descriptions(&self) -> &[FieldDescription] {
        self.rows.field_descriptions()
    }

    pub fn err(&self) -> Option<Error> {
        self.rows.err()
    }

    pub fn command_tag(&self) -> CommandTag {
        self.rows.command_tag()
    }

    /// Close the rows and give up the lease, if any.
    pub fn close(&mut self) {
        self.rows.close();
        self.lease = None;
    }
}

impl std::fmt::Debug for TracedRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedRows")
            .field("fields", &self.rows.field_descriptions())
            .field("leased", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

/// Placeholder row for an operation rejected before execution.
#[derive(Debug, Clone)]
pub struct ClosedRow {
    err: Error,
}

impl ClosedRow {
    pub fn new(err: Error) -> Self {
        Self { err }
    }
}

#[async_trait]
impl Row for ClosedRow {
    async fn scan(self: Box<Self>) -> Result<Vec<Value>, Error> {
        Err(self.err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfig;
    use crate::mock::{MockRow, MockRows, MockTracer};
    use std::sync::Arc;

    fn query_tracer(tracer: &MockTracer) -> QueryTracer {
        QueryTracer::new(TracingConfig::default(), Arc::new(tracer.clone()))
    }

    fn pending(tracer: &MockTracer, sql: &str) -> PendingTrace {
        PendingTrace::new(
            query_tracer(tracer),
            &QueryContext::new().with_span_tag("request_id", "r-1"),
            QueryKind::Query,
            sql,
            SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn test_scan_emits_one_span() {
        let tracer = MockTracer::new();
        let row = TracedRow::new(
            Box::new(MockRow::new(Ok(vec![Value::Int(1)]))),
            pending(&tracer, "SELECT 1"),
        );
        assert!(tracer.finished_spans().is_empty());

        let values = row.scan().await.unwrap();
        assert_eq!(values, vec![Value::Int(1)]);

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].query_kind(), Some("Query"));
        assert_eq!(spans[0].resource(), Some("SELECT 1"));
        assert_eq!(spans[0].tag_str("request_id"), Some("r-1"));
    }

    #[tokio::test]
    async fn test_scan_error_is_attached() {
        let tracer = MockTracer::new();
        let row = TracedRow::new(
            Box::new(MockRow::new(Err(Error::database("no rows in result set")))),
            pending(&tracer, "SELECT 1 WHERE false"),
        );

        let err = row.scan().await.unwrap_err();
        assert_eq!(err.to_string(), "no rows in result set");
        assert_eq!(
            tracer.finished_spans()[0].error.as_deref(),
            Some("no rows in result set")
        );
    }

    #[test]
    fn test_close_emits_span() {
        let tracer = MockTracer::new();
        let row = TracedRow::new(
            Box::new(MockRow::new(Ok(vec![]))),
            pending(&tracer, "SELECT 1"),
        );
        row.close();
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].error.is_none());
    }

    #[test]
    fn test_dropped_row_emits_span() {
        let tracer = MockTracer::new();
        let row = TracedRow::new(
            Box::new(MockRow::new(Ok(vec![]))),
            pending(&tracer, "SELECT 1"),
        );
        drop(row);
        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].resource(), Some("SELECT 1"));
        assert!(spans[0].error.is_none());
    }

    #[tokio::test]
    async fn test_scanned_row_emits_only_once() {
        let tracer = MockTracer::new();
        let row = TracedRow::new(
            Box::new(MockRow::new(Err(Error::database("no rows in result set")))),
            pending(&tracer, "SELECT 1"),
        );
        row.scan().await.unwrap_err();
        assert_eq!(tracer.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn test_row_lease_held_until_scan() {
        let lease = Arc::new(());
        let row = TracedRow::untraced(Box::new(MockRow::new(Ok(vec![Value::Int(1)]))))
            .with_lease(Arc::clone(&lease));
        assert_eq!(Arc::strong_count(&lease), 2);

        row.scan().await.unwrap();
        assert_eq!(Arc::strong_count(&lease), 1);
    }

    #[tokio::test]
    async fn test_rows_lease_held_until_close() {
        let lease = Arc::new(());
        let mut rows = TracedRows::new(Box::new(MockRows::new(&["id"], vec![vec![Value::Int(1)]])))
            .with_lease(Arc::clone(&lease));

        assert!(rows.next().await);
        assert_eq!(Arc::strong_count(&lease), 2);
        rows.close();
        assert_eq!(Arc::strong_count(&lease), 1);
    }

    #[tokio::test]
    async fn test_closed_row_returns_stored_error() {
        let row = TracedRow::closed(Error::TxClosed);
        assert!(row.scan().await.unwrap_err().is_tx_closed());
    }

    #[tokio::test]
    async fn test_traced_rows_forward() {
        let mut rows = TracedRows::new(Box::new(MockRows::new(
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::Text("ann".into())],
                vec![Value::Int(2), Value::Null],
            ],
        )));

        assert_eq!(rows.field_descriptions()[1].name, "name");
        assert!(rows.next().await);
        assert_eq!(rows.values().unwrap()[1], Value::Text("ann".into()));
        assert!(rows.next().await);
        assert_eq!(rows.raw_values(), vec![Some(b"2".to_vec()), None]);
        assert!(!rows.next().await);
        assert!(rows.err().is_none());
        assert_eq!(rows.command_tag().as_str(), "SELECT 2");
        rows.close();
    }
}
