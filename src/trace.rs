//! The single path through which every proxy reports a query span.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::TracingConfig;
use crate::context::QueryContext;
use crate::error::Error;
use crate::parser::QueryKind;
use crate::sink::{FinishOptions, StartSpanOptions, TagValue, TraceError, Tracer, SPAN_TYPE_SQL};

/// Tag holding the query kind.
pub const QUERY_TYPE_TAG: &str = "sql.query_type";

/// Tag holding the query text or synthetic resource.
pub const RESOURCE_TAG: &str = "resource.name";

/// Tag holding the analytics sample rate.
pub const ANALYTICS_RATE_TAG: &str = "analytics.sample_rate";

/// Everything needed to report one traced call.
#[derive(Debug, Clone)]
pub struct TraceQueryParams<'a> {
    pub service_name: &'a str,
    pub operation_name: &'a str,
    pub analytics_rate: f64,
    pub span_tags: &'a BTreeMap<String, String>,
    /// Value of the query type tag, usually a [`QueryKind`] string.
    pub query_type: &'a str,
    pub query: &'a str,
    pub start_time: SystemTime,
    pub finish_time: Option<SystemTime>,
    pub error: Option<&'a Error>,
    /// Tags set after the query type and resource, before configured tags.
    pub extra_tags: Vec<(&'static str, TagValue)>,
}

impl<'a> TraceQueryParams<'a> {
    /// Parameters for a call described by `config`, finishing now and without error.
    pub fn new(
        config: &'a TracingConfig,
        query_kind: QueryKind,
        query: &'a str,
        start_time: SystemTime,
    ) -> Self {
        Self::with_query_type(config, query_kind.as_str(), query, start_time)
    }

    /// Like [`new`](Self::new), for calls whose type is not a [`QueryKind`],
    /// such as messages reported through a [`QueryLogger`](crate::QueryLogger).
    pub fn with_query_type(
        config: &'a TracingConfig,
        query_type: &'a str,
        query: &'a str,
        start_time: SystemTime,
    ) -> Self {
        Self {
            service_name: &config.service_name,
            operation_name: &config.operation_name,
            analytics_rate: config.analytics_rate,
            span_tags: &config.span_tags,
            query_type,
            query,
            start_time,
            finish_time: None,
            error: None,
            extra_tags: Vec::new(),
        }
    }

    /// Finish the span at `finish_time` instead of now.
    pub fn finish_time(mut self, finish_time: Option<SystemTime>) -> Self {
        self.finish_time = finish_time;
        self
    }

    /// Attach the call's error, if any.
    pub fn error(mut self, error: Option<&'a Error>) -> Self {
        self.error = error;
        self
    }

    /// Add a tag describing the call.
    pub fn tag(mut self, key: &'static str, value: impl Into<TagValue>) -> Self {
        self.extra_tags.push((key, value.into()));
        self
    }
}

/// Report one traced call to `tracer`.
///
/// Sink failures are logged at debug level and dropped: the caller's database
/// result never depends on whether its span was recorded.
pub fn trace_query(tracer: &dyn Tracer, ctx: &QueryContext, params: TraceQueryParams<'_>) {
    let query_type = params.query_type.to_string();
    if let Err(err) = try_trace_query(tracer, ctx, params) {
        tracing::debug!(error = %err, query_type = %query_type, "Dropping query span");
    }
}

fn try_trace_query(
    tracer: &dyn Tracer,
    ctx: &QueryContext,
    params: TraceQueryParams<'_>,
) -> Result<(), TraceError> {
    let mut tags = Vec::new();
    if !params.analytics_rate.is_nan() {
        tags.push((
            ANALYTICS_RATE_TAG.to_string(),
            TagValue::Float(params.analytics_rate),
        ));
    }

    let mut span = tracer.start_span(
        params.operation_name,
        StartSpanOptions {
            service_name: params.service_name.to_string(),
            span_type: SPAN_TYPE_SQL,
            start_time: params.start_time,
            tags,
        },
    )?;

    let resource = if params.query.is_empty() {
        params.query_type
    } else {
        params.query
    };
    span.set_tag(QUERY_TYPE_TAG, params.query_type.into());
    span.set_tag(RESOURCE_TAG, resource.into());
    for (key, value) in params.extra_tags {
        span.set_tag(key, value);
    }

    for (key, value) in params.span_tags {
        span.set_tag(key, value.as_str().into());
    }
    for (key, value) in ctx.span_tags() {
        span.set_tag(key, value.into());
    }

    // the zero time means "not provided"
    let finish_time = params
        .finish_time
        .filter(|time| *time != SystemTime::UNIX_EPOCH);

    span.finish(FinishOptions {
        finish_time,
        error: params.error,
    })
}

/// Frozen configuration plus sink, shared by a connection and all proxies it creates.
#[derive(Clone)]
pub(crate) struct QueryTracer {
    config: Arc<TracingConfig>,
    tracer: Arc<dyn Tracer>,
}

impl QueryTracer {
    pub(crate) fn new(config: TracingConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            config: Arc::new(config),
            tracer,
        }
    }

    pub(crate) fn config(&self) -> &TracingConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }

    pub(crate) fn trace(
        &self,
        ctx: &QueryContext,
        kind: QueryKind,
        query: &str,
        start_time: SystemTime,
        finish_time: Option<SystemTime>,
        error: Option<&Error>,
    ) {
        let params = TraceQueryParams::new(&self.config, kind, query, start_time)
            .finish_time(finish_time)
            .error(error);
        trace_query(self.tracer.as_ref(), ctx, params);
    }
}

impl std::fmt::Debug for QueryTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTracer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
