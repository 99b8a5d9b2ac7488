//! Span sink abstraction and the default sink built on the `tracing` crate.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::field;

use crate::error::Error;
use crate::trace::{QUERY_TYPE_TAG, RESOURCE_TAG};

/// Span type given to every database span.
pub const SPAN_TYPE_SQL: &str = "sql";

/// Value of a span tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl TagValue {
    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float, if it is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Str(s) => write!(f, "{}", s),
            TagValue::Int(v) => write!(f, "{}", v),
            TagValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

/// Options given when a span starts.
#[derive(Debug, Clone)]
pub struct StartSpanOptions {
    pub service_name: String,
    pub span_type: &'static str,
    pub start_time: SystemTime,
    pub tags: Vec<(String, TagValue)>,
}

/// Options given when a span finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishOptions<'a> {
    /// Finish time; `None` finishes the span now.
    pub finish_time: Option<SystemTime>,
    /// Error attached to the span.
    pub error: Option<&'a Error>,
}

/// Failure inside a span sink. Never surfaced to database callers.
#[derive(Error, Debug, Clone)]
#[error("span sink failure: {0}")]
pub struct TraceError(pub String);

/// Destination for query spans.
pub trait Tracer: Send + Sync {
    /// Start a span named `operation_name`.
    fn start_span(
        &self,
        operation_name: &str,
        options: StartSpanOptions,
    ) -> Result<Box<dyn TraceSpan>, TraceError>;
}

/// A started span.
pub trait TraceSpan: Send {
    /// Set a tag, replacing any previous value for `key`.
    fn set_tag(&mut self, key: &str, value: TagValue);

    /// Finish the span.
    fn finish(self: Box<Self>, options: FinishOptions<'_>) -> Result<(), TraceError>;
}

/// Sink that reports every finished query as a `tracing` span.
///
/// Spans become children of the span that is current when the query finishes,
/// so they nest under request spans created by web framework middleware.
///
/// | Field | Description |
/// |-------|-------------|
/// | `otel.name` | Operation name (`pg.query` by default) |
/// | `db.system` | Always `"postgresql"` |
/// | `service.name` | Configured service name |
/// | `resource.name` | Query text or synthetic resource |
/// | `sql.query_type` | Query kind |
/// | `db.duration_ms` | Time between start and finish |
/// | `tags` | Remaining tags |
/// | `otel.status_code` | `"OK"` or `"ERROR"` |
/// | `error.message` | Error details (on failure) |
/// | `slow_query` | Set when the query exceeded the slow threshold |
#[derive(Debug, Clone)]
pub struct TracingTracer {
    slow_query_threshold: Duration,
}

impl Default for TracingTracer {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(500),
        }
    }
}

impl TracingTracer {
    /// Create a sink with the default 500ms slow query threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the threshold for slow query warnings.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }
}

impl Tracer for TracingTracer {
    fn start_span(
        &self,
        operation_name: &str,
        options: StartSpanOptions,
    ) -> Result<Box<dyn TraceSpan>, TraceError> {
        let tags = options.tags.iter().cloned().collect();
        Ok(Box::new(PendingSpan {
            operation_name: operation_name.to_string(),
            options,
            tags,
            slow_query_threshold: self.slow_query_threshold,
        }))
    }
}

struct PendingSpan {
    operation_name: String,
    options: StartSpanOptions,
    tags: BTreeMap<String, TagValue>,
    slow_query_threshold: Duration,
}

impl TraceSpan for PendingSpan {
    fn set_tag(&mut self, key: &str, value: TagValue) {
        self.tags.insert(key.to_string(), value);
    }

    fn finish(mut self: Box<Self>, options: FinishOptions<'_>) -> Result<(), TraceError> {
        let finish_time = options.finish_time.unwrap_or_else(SystemTime::now);
        let elapsed = finish_time
            .duration_since(self.options.start_time)
            .unwrap_or_default();
        let duration_ms = elapsed.as_millis() as i64;

        let resource = self.tags.remove(RESOURCE_TAG);
        let query_type = self.tags.remove(QUERY_TYPE_TAG);

        let span = tracing::info_span!(
            "pg.query",
            otel.name = %self.operation_name,
            db.system = "postgresql",
            service.name = %self.options.service_name,
            span_type = self.options.span_type,
            resource.name = field::Empty,
            sql.query_type = field::Empty,
            db.duration_ms = duration_ms,
            tags = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            slow_query = field::Empty,
        );

        if let Some(resource) = &resource {
            span.record("resource.name", field::display(resource));
        }
        if let Some(query_type) = &query_type {
            span.record("sql.query_type", field::display(query_type));
        }
        if !self.tags.is_empty() {
            span.record("tags", field::debug(&self.tags));
        }

        if elapsed > self.slow_query_threshold {
            span.record("slow_query", true);
            let threshold_ms = self.slow_query_threshold.as_millis() as i64;
            tracing::warn!(
                parent: &span,
                duration_ms = duration_ms,
                threshold_ms = threshold_ms,
                "Slow query detected"
            );
        }

        match options.error {
            None => {
                span.record("otel.status_code", "OK");
            }
            Some(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", e.to_string().as_str());
                tracing::error!(
                    parent: &span,
                    error = %e,
                    "Database query failed"
                );
            }
        }

        Ok(())
    }
}
