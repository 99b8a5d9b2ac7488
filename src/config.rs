//! Configuration for traced connections.

use std::collections::BTreeMap;

/// Operation name given to every span unless overridden.
pub const DEFAULT_OPERATION_NAME: &str = "pg.query";

/// Service name used when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "postgres";

const ENV_SERVICE_NAME: &str = "PG_TRACING_SERVICE_NAME";
const ENV_ANALYTICS_ENABLED: &str = "PG_TRACING_ANALYTICS_ENABLED";
const ENV_OPERATION_NAME: &str = "PG_TRACING_OPERATION_NAME";

/// Tracing configuration shared by a connection and every proxy it creates.
///
/// A configuration is resolved once, from defaults plus an ordered list of
/// [`TracingOption`]s, and never changes afterwards.
///
/// # Example
///
/// ```rust
/// use pg_tracing::{TracingConfig, TracingOption};
///
/// let config = TracingConfig::resolve([
///     TracingOption::ServiceName("billing-db".into()),
///     TracingOption::AnalyticsRate(0.25),
/// ]);
/// assert_eq!(config.service_name, "billing-db");
/// assert_eq!(config.analytics_rate, 0.25);
/// ```
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name attached to every span.
    /// Default: `"postgres"`
    pub service_name: String,

    /// Analytics sample rate attached to every span.
    /// `NaN` means disabled and the tag is omitted.
    /// Default: `NaN`
    pub analytics_rate: f64,

    /// Tags applied to every span.
    pub span_tags: BTreeMap<String, String>,

    /// Name of the spans.
    /// Default: `"pg.query"`
    pub operation_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            analytics_rate: f64::NAN,
            span_tags: BTreeMap::new(),
            operation_name: DEFAULT_OPERATION_NAME.to_string(),
        }
    }
}

/// A single configuration change. Later options win over earlier ones.
#[derive(Debug, Clone, PartialEq)]
pub enum TracingOption {
    /// Set the service name.
    ServiceName(String),
    /// `true` samples every span (rate `1.0`), `false` disables analytics.
    Analytics(bool),
    /// Sample rate in `[0, 1]`; anything else disables analytics.
    AnalyticsRate(f64),
    /// Replace the tags applied to every span.
    SpanTags(BTreeMap<String, String>),
    /// Set the span operation name.
    OperationName(String),
}

impl TracingOption {
    fn apply(self, config: &mut TracingConfig) {
        match self {
            TracingOption::ServiceName(name) => config.service_name = name,
            TracingOption::Analytics(on) => {
                config.analytics_rate = if on { 1.0 } else { f64::NAN };
            }
            TracingOption::AnalyticsRate(rate) => {
                config.analytics_rate = if (0.0..=1.0).contains(&rate) {
                    rate
                } else {
                    f64::NAN
                };
            }
            TracingOption::SpanTags(tags) => config.span_tags = tags,
            TracingOption::OperationName(name) => config.operation_name = name,
        }
    }
}

impl TracingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `options` in order on top of the defaults.
    pub fn resolve<I>(options: I) -> Self
    where
        I: IntoIterator<Item = TracingOption>,
    {
        Self::default().with_options(options)
    }

    /// Defaults taken from the environment.
    ///
    /// Reads `PG_TRACING_SERVICE_NAME`, `PG_TRACING_ANALYTICS_ENABLED` and
    /// `PG_TRACING_OPERATION_NAME`; unset variables keep the built-in defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Vec::new();
        if let Some(name) = lookup(ENV_SERVICE_NAME).filter(|v| !v.is_empty()) {
            options.push(TracingOption::ServiceName(name));
        }
        if let Some(on) = lookup(ENV_ANALYTICS_ENABLED).and_then(|v| parse_bool(&v)) {
            options.push(TracingOption::Analytics(on));
        }
        if let Some(name) = lookup(ENV_OPERATION_NAME).filter(|v| !v.is_empty()) {
            options.push(TracingOption::OperationName(name));
        }
        Self::resolve(options)
    }

    /// Apply further options to this configuration.
    pub fn with_options<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = TracingOption>,
    {
        for option in options {
            option.apply(&mut self);
        }
        self
    }

    /// Set the service name attached to spans.
    pub fn with_service_name(self, name: impl Into<String>) -> Self {
        self.with_options([TracingOption::ServiceName(name.into())])
    }

    /// Enable (rate `1.0`) or disable analytics.
    pub fn with_analytics(self, on: bool) -> Self {
        self.with_options([TracingOption::Analytics(on)])
    }

    /// Set the analytics sample rate. Values outside `[0, 1]` disable analytics.
    pub fn with_analytics_rate(self, rate: f64) -> Self {
        self.with_options([TracingOption::AnalyticsRate(rate)])
    }

    /// Replace the tags applied to every span.
    pub fn with_span_tags<I, K, V>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.with_options([TracingOption::SpanTags(tags)])
    }

    /// Set the span operation name.
    pub fn with_operation_name(self, name: impl Into<String>) -> Self {
        self.with_options([TracingOption::OperationName(name.into())])
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "postgres");
        assert_eq!(config.operation_name, "pg.query");
        assert!(config.analytics_rate.is_nan());
        assert!(config.span_tags.is_empty());
    }

    #[test]
    fn test_resolve_options() {
        let config = TracingConfig::resolve([
            TracingOption::ServiceName("testing-time".into()),
            TracingOption::Analytics(false),
            TracingOption::SpanTags(BTreeMap::from([
                ("altered".to_string(), "beast".to_string()),
                ("alter".to_string(), "me".to_string()),
            ])),
        ]);

        assert_eq!(config.service_name, "testing-time");
        assert!(config.analytics_rate.is_nan());
        assert!(config.span_tags.contains_key("altered"));
        assert!(config.span_tags.contains_key("alter"));
    }

    #[test]
    fn test_last_option_wins() {
        let config = TracingConfig::resolve([
            TracingOption::ServiceName("first".into()),
            TracingOption::AnalyticsRate(0.5),
            TracingOption::ServiceName("second".into()),
            TracingOption::Analytics(true),
        ]);
        assert_eq!(config.service_name, "second");
        assert_eq!(config.analytics_rate, 1.0);

        let config = TracingConfig::new()
            .with_analytics(true)
            .with_analytics_rate(0.5);
        assert_eq!(config.analytics_rate, 0.5);
    }

    #[test]
    fn test_analytics_rate_bounds() {
        assert_eq!(TracingConfig::new().with_analytics_rate(0.0).analytics_rate, 0.0);
        assert_eq!(TracingConfig::new().with_analytics_rate(1.0).analytics_rate, 1.0);
        assert!(TracingConfig::new().with_analytics_rate(1.5).analytics_rate.is_nan());
        assert!(TracingConfig::new().with_analytics_rate(-0.1).analytics_rate.is_nan());
        assert!(TracingConfig::new()
            .with_analytics(true)
            .with_analytics_rate(f64::NAN)
            .analytics_rate
            .is_nan());
    }

    #[test]
    fn test_span_tags_replace() {
        let config = TracingConfig::new()
            .with_span_tags([("env", "staging")])
            .with_span_tags([("team", "payments")]);
        assert_eq!(config.span_tags.len(), 1);
        assert_eq!(config.span_tags.get("team").map(String::as_str), Some("payments"));
    }

    #[test]
    fn test_from_lookup() {
        let config = TracingConfig::from_lookup(|key| match key {
            ENV_SERVICE_NAME => Some("orders-db".to_string()),
            ENV_ANALYTICS_ENABLED => Some("TRUE".to_string()),
            _ => None,
        });
        assert_eq!(config.service_name, "orders-db");
        assert_eq!(config.analytics_rate, 1.0);
        assert_eq!(config.operation_name, DEFAULT_OPERATION_NAME);

        let config = TracingConfig::from_lookup(|key| match key {
            ENV_ANALYTICS_ENABLED => Some("maybe".to_string()),
            ENV_OPERATION_NAME => Some("orders.query".to_string()),
            _ => None,
        });
        assert!(config.analytics_rate.is_nan());
        assert_eq!(config.operation_name, "orders.query");
    }
}
