//! Tracing for clients that report finished calls through a logging hook.
//!
//! Some drivers do not expose their calls for wrapping but log each one after
//! it completes. [`TracingLogger`] sits in front of such a [`QueryLogger`],
//! turns the driver's query messages into spans and then forwards every
//! message unchanged.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, trace, warn};

use crate::client::CommandTag;
use crate::config::{TracingConfig, TracingOption};
use crate::context::QueryContext;
use crate::error::Error;
use crate::sink::{Tracer, TracingTracer};
use crate::trace::{trace_query, QueryTracer, TraceQueryParams};

/// Tag holding the command tag of a logged call.
pub const COMMAND_TAG_TAG: &str = "pg.command_tag";

/// Tag holding the number of rows a logged call returned or copied.
pub const ROW_COUNT_TAG: &str = "pg.row_count";

/// Tag holding the target table of a logged `COPY`.
pub const TABLE_NAME_TAG: &str = "pg.table_name";

/// Tag holding the target columns of a logged `COPY`, comma separated.
pub const COLUMN_NAMES_TAG: &str = "pg.column_names";

/// Messages that describe a finished call and are traced.
pub const TRACED_MESSAGES: [&str; 6] = [
    "BatchResult.Close",
    "BatchResult.Exec",
    "BatchResult.Query",
    "CopyFrom",
    "Exec",
    "Query",
];

/// Severity of a logged message, most verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "none",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Details a client attaches to a logged message. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct LogData {
    pub sql: Option<String>,
    pub command_tag: Option<CommandTag>,
    pub row_count: Option<u64>,
    pub table_name: Option<String>,
    pub column_names: Option<Vec<String>>,
    /// When the call started.
    pub start_time: Option<SystemTime>,
    /// How long the call took; used when `start_time` is absent.
    pub time: Option<Duration>,
    pub err: Option<Error>,
}

impl LogData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_command_tag(mut self, tag: CommandTag) -> Self {
        self.command_tag = Some(tag);
        self
    }

    pub fn with_row_count(mut self, count: u64) -> Self {
        self.row_count = Some(count);
        self
    }

    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn with_column_names<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_time(mut self, time: Duration) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_err(mut self, err: Error) -> Self {
        self.err = Some(err);
        self
    }
}

/// Logging hook a client calls after each call it makes.
pub trait QueryLogger: Send + Sync {
    fn log(&self, ctx: &QueryContext, level: LogLevel, msg: &str, data: &LogData);
}

impl<L: QueryLogger + ?Sized> QueryLogger for Arc<L> {
    fn log(&self, ctx: &QueryContext, level: LogLevel, msg: &str, data: &LogData) {
        (**self).log(ctx, level, msg, data)
    }
}

/// Logger that writes every message as a `tracing` event at its level.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogger;

impl QueryLogger for EventLogger {
    fn log(&self, _ctx: &QueryContext, level: LogLevel, msg: &str, data: &LogData) {
        let sql = data.sql.as_deref().unwrap_or_default();
        let duration_ms = data.time.map(|time| time.as_millis() as i64);
        match level {
            LogLevel::Trace => trace!(sql, ?duration_ms, "{msg}"),
            LogLevel::Debug => debug!(sql, ?duration_ms, "{msg}"),
            LogLevel::Info => info!(sql, ?duration_ms, "{msg}"),
            LogLevel::Warn => warn!(sql, ?duration_ms, "{msg}"),
            LogLevel::Error => match &data.err {
                Some(err) => error!(sql, error = %err, "{msg}"),
                None => error!(sql, "{msg}"),
            },
            LogLevel::None => {}
        }
    }
}

/// Wraps a [`QueryLogger`] so that call messages also produce query spans.
///
/// Only the messages in [`TRACED_MESSAGES`] are traced. The span's query type
/// is the message, its resource the logged SQL (or the message when there is
/// none), and it finishes when the message is received. The start is the
/// logged `start_time`, else the finish minus the logged `time`. Every message
/// is forwarded to the wrapped logger whether or not it was traced, so the
/// client's log level also decides which calls are traced.
///
/// # Example
///
/// ```rust,ignore
/// use pg_tracing::{EventLogger, TracingConfig, TracingLogger};
///
/// let logger = TracingLogger::new(EventLogger, TracingConfig::from_env());
/// driver_config.set_logger(logger);
/// ```
pub struct TracingLogger<L> {
    logger: L,
    tracer: QueryTracer,
}

impl<L> std::fmt::Debug for TracingLogger<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingLogger")
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl<L: QueryLogger> TracingLogger<L> {
    /// Wrap `logger`, reporting spans to the default `tracing` sink.
    pub fn new(logger: L, config: TracingConfig) -> Self {
        Self::with_tracer(logger, config, Arc::new(TracingTracer::default()))
    }

    pub fn with_options<I>(logger: L, options: I) -> Self
    where
        I: IntoIterator<Item = TracingOption>,
    {
        Self::new(logger, TracingConfig::resolve(options))
    }

    pub fn with_tracer(logger: L, config: TracingConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            logger,
            tracer: QueryTracer::new(config, tracer),
        }
    }

    /// Get a reference to the wrapped logger.
    pub fn inner(&self) -> &L {
        &self.logger
    }

    pub fn config(&self) -> &TracingConfig {
        self.tracer.config()
    }

    fn trace(&self, ctx: &QueryContext, msg: &str, data: &LogData) {
        let finish_time = SystemTime::now();
        if !TRACED_MESSAGES.iter().any(|known| *known == msg) {
            return;
        }

        let start_time = data
            .start_time
            .or_else(|| data.time.and_then(|time| finish_time.checked_sub(time)))
            .unwrap_or(finish_time);
        let query = data.sql.as_deref().unwrap_or_default();

        let mut params =
            TraceQueryParams::with_query_type(self.tracer.config(), msg, query, start_time)
                .finish_time(Some(finish_time))
                .error(data.err.as_ref());
        if let Some(tag) = &data.command_tag {
            params = params.tag(COMMAND_TAG_TAG, tag.as_str());
        }
        if let Some(count) = data.row_count {
            params = params.tag(ROW_COUNT_TAG, count);
        }
        if let Some(table) = &data.table_name {
            params = params.tag(TABLE_NAME_TAG, table.as_str());
        }
        if let Some(columns) = &data.column_names {
            params = params.tag(COLUMN_NAMES_TAG, columns.join(","));
        }

        trace_query(self.tracer.sink(), ctx, params);
    }
}

impl<L: QueryLogger> QueryLogger for TracingLogger<L> {
    fn log(&self, ctx: &QueryContext, level: LogLevel, msg: &str, data: &LogData) {
        self.trace(ctx, msg, data);
        self.logger.log(ctx, level, msg, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CopyFromRows, PgClient};
    use crate::mock::{MockClient, MockLogger, MockTracer};
    use crate::parser::Identifier;
    use crate::sink::TagValue;

    fn wrapped(tracer: &MockTracer) -> TracingLogger<MockLogger> {
        TracingLogger::with_tracer(
            MockLogger::new(),
            TracingConfig::default().with_service_name("logged-db"),
            Arc::new(tracer.clone()),
        )
    }

    #[test]
    fn test_call_messages_are_traced_and_forwarded() {
        let tracer = MockTracer::new();
        let logger = wrapped(&tracer);
        let data = LogData::new()
            .with_sql("UPDATE t SET a = 1")
            .with_command_tag(CommandTag::new("UPDATE 3"))
            .with_time(Duration::from_millis(20));

        logger.log(&QueryContext::new(), LogLevel::Info, "Exec", &data);

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].service_name, "logged-db");
        assert_eq!(spans[0].query_kind(), Some("Exec"));
        assert_eq!(spans[0].resource(), Some("UPDATE t SET a = 1"));
        assert_eq!(spans[0].tag_str(COMMAND_TAG_TAG), Some("UPDATE 3"));
        let elapsed = spans[0]
            .finish_time
            .duration_since(spans[0].start_time)
            .unwrap();
        assert_eq!(elapsed, Duration::from_millis(20));

        let logged = logger.inner().messages();
        assert_eq!(logged, vec![(LogLevel::Info, "Exec".to_string())]);
    }

    #[test]
    fn test_other_messages_are_only_forwarded() {
        let tracer = MockTracer::new();
        let logger = wrapped(&tracer);

        logger.log(&QueryContext::new(), LogLevel::Debug, "Prepare", &LogData::new());
        logger.log(&QueryContext::new(), LogLevel::Info, "closed connection", &LogData::new());

        assert!(tracer.finished_spans().is_empty());
        assert_eq!(logger.inner().messages().len(), 2);
    }

    #[test]
    fn test_copy_from_tags() {
        let tracer = MockTracer::new();
        let logger = wrapped(&tracer);
        let start = SystemTime::now() - Duration::from_secs(1);
        let data = LogData::new()
            .with_table_name("orders")
            .with_column_names(["id", "total"])
            .with_row_count(42)
            .with_start_time(start);

        logger.log(&QueryContext::new(), LogLevel::Info, "CopyFrom", &data);

        let span = &tracer.finished_spans()[0];
        assert_eq!(span.resource(), Some("CopyFrom"));
        assert_eq!(span.start_time, start);
        assert_eq!(span.tag_str(TABLE_NAME_TAG), Some("orders"));
        assert_eq!(span.tag_str(COLUMN_NAMES_TAG), Some("id,total"));
        assert_eq!(span.tag(ROW_COUNT_TAG), Some(&TagValue::Int(42)));
        assert!(span.tag(COMMAND_TAG_TAG).is_none());
    }

    #[test]
    fn test_error_and_tags() {
        let tracer = MockTracer::new();
        let logger = TracingLogger::with_tracer(
            MockLogger::new(),
            TracingConfig::default()
                .with_analytics_rate(1.0)
                .with_span_tags([("env", "test")]),
            Arc::new(tracer.clone()),
        );
        let ctx = QueryContext::new().with_span_tag("request_id", "r-7");
        let data = LogData::new()
            .with_sql("SELECT * FROM missing")
            .with_err(Error::database("relation \"missing\" does not exist"));

        logger.log(&ctx, LogLevel::Error, "Query", &data);

        let span = &tracer.finished_spans()[0];
        assert_eq!(
            span.error.as_deref(),
            Some("relation \"missing\" does not exist")
        );
        assert_eq!(span.tag_str("env"), Some("test"));
        assert_eq!(span.tag_str("request_id"), Some("r-7"));
        assert!(span.tag(crate::trace::ANALYTICS_RATE_TAG).is_some());
    }

    #[tokio::test]
    async fn test_logging_client_calls_become_spans() {
        let tracer = MockTracer::new();
        let inner = MockLogger::new();
        let client = MockClient::new().with_logger(TracingLogger::with_tracer(
            inner.clone(),
            TracingConfig::default(),
            Arc::new(tracer.clone()),
        ));
        client.respond_with_tag("DELETE FROM sessions", "DELETE 4");
        client.fail_on("SELECT nope", Error::database("column \"nope\" does not exist"));
        let ctx = QueryContext::new();

        client.exec(&ctx, "DELETE FROM sessions", &[]).await.unwrap();
        client.query(&ctx, "SELECT nope", &[]).await.err().expect("query should fail");
        let mut source = CopyFromRows::new(vec![vec![1.into()], vec![2.into()]]);
        let copied = client
            .copy_from(&ctx, &Identifier::from("t"), &["a".to_string()], &mut source)
            .await
            .unwrap();
        assert_eq!(copied, 2);

        let spans = tracer.finished_spans();
        let kinds: Vec<_> = spans.iter().filter_map(|span| span.query_kind()).collect();
        assert_eq!(kinds, vec!["Exec", "Query", "CopyFrom"]);
        assert_eq!(spans[0].tag_str(COMMAND_TAG_TAG), Some("DELETE 4"));
        assert!(spans[1].error.is_some());
        assert_eq!(spans[2].tag_str(TABLE_NAME_TAG), Some("t"));
        assert_eq!(spans[2].tag(ROW_COUNT_TAG), Some(&TagValue::Int(2)));

        let levels: Vec<_> = inner.messages().into_iter().map(|(level, _)| level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error, LogLevel::Info]);
    }

    #[test]
    fn test_event_logger_accepts_every_level() {
        let data = LogData::new().with_sql("SELECT 1").with_err(Error::database("boom"));
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::None,
        ] {
            EventLogger.log(&QueryContext::new(), level, "Query", &data);
        }
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
