//! Per-call context threaded through every traced operation.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Request-scoped data passed to every traced operation.
///
/// Span tags attached here are added to every span created with this context,
/// including spans emitted later by row and batch proxies created from it.
/// Cancellation is not carried here: drop the operation's future, or wrap it
/// in a timeout, to abandon it.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    span_tags: Option<Arc<BTreeMap<String, String>>>,
}

impl QueryContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context with `tags` added, overriding existing keys.
    pub fn with_span_tags<I, K, V>(&self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self
            .span_tags
            .as_deref()
            .cloned()
            .unwrap_or_default();
        merged.extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            span_tags: Some(Arc::new(merged)),
        }
    }

    /// A copy of this context with one more tag.
    pub fn with_span_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_span_tags([(key.into(), value.into())])
    }

    /// Tags carried by this context.
    pub fn span_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.span_tags
            .iter()
            .flat_map(|tags| tags.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
