//! SQL text inspection: query kind classification and table identifier rendering.

use once_cell::sync::Lazy;
use regex::Regex;

/// Kind of a traced database operation, recorded as `sql.query_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Query,
    Exec,
    Begin,
    Commit,
    Rollback,
    Close,
    CopyFrom,
    Deallocate,
    Ping,
    Prepare,
    SendBatch,
}

impl QueryKind {
    /// Returns the kind as recorded on spans.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Query => "Query",
            QueryKind::Exec => "Exec",
            QueryKind::Begin => "Begin",
            QueryKind::Commit => "Commit",
            QueryKind::Rollback => "Rollback",
            QueryKind::Close => "Close",
            QueryKind::CopyFrom => "CopyFrom",
            QueryKind::Deallocate => "Deallocate",
            QueryKind::Ping => "Ping",
            QueryKind::Prepare => "Prepare",
            QueryKind::SendBatch => "SendBatch",
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify the SQL text of a generic `exec` or `query` call.
///
/// The rules are syntactic and case-sensitive: text starting with `begin` is a
/// [`QueryKind::Begin`], exactly `commit` is a [`QueryKind::Commit`], exactly
/// `;` is a [`QueryKind::Ping`]. Anything else keeps the call's own `default`.
pub fn classify(default: QueryKind, sql: &str) -> QueryKind {
    if sql.starts_with("begin") {
        QueryKind::Begin
    } else if sql == "commit" {
        QueryKind::Commit
    } else if sql == ";" {
        QueryKind::Ping
    } else {
        default
    }
}

// Identifiers PostgreSQL accepts without quoting
static PLAIN_IDENTIFIER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_$]*$").unwrap());

/// A possibly schema-qualified table name, e.g. `["public", "users"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier(Vec<String>);

impl Identifier {
    /// Build an identifier from its dotted parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The identifier's parts, outermost first.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Render the identifier for inclusion in SQL text.
    ///
    /// Plain lowercase parts are emitted as-is; every other part is double-quoted
    /// with embedded quotes doubled. NUL characters are dropped.
    pub fn sanitize(&self) -> String {
        self.0
            .iter()
            .map(|part| sanitize_part(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn sanitize_part(part: &str) -> String {
    let cleaned: String = part.chars().filter(|c| *c != '\0').collect();
    if PLAIN_IDENTIFIER_REGEX.is_match(&cleaned) {
        cleaned
    } else {
        format!("\"{}\"", cleaned.replace('"', "\"\""))
    }
}

impl From<&str> for Identifier {
    fn from(table: &str) -> Self {
        Self::new([table])
    }
}

impl From<Vec<String>> for Identifier {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sanitize())
    }
}

/// Resource text recorded for a `copy_from` call.
pub fn copy_from_resource(table: &Identifier) -> String {
    format!("COPY {} FROM stdin", table.sanitize())
}

/// Resource text recorded when a batch is closed.
pub fn send_batch_resource(batch_len: usize) -> String {
    format!("send batch (len = {})", batch_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_begin_prefix() {
        assert_eq!(classify(QueryKind::Exec, "begin"), QueryKind::Begin);
        assert_eq!(
            classify(QueryKind::Exec, "begin isolation level serializable"),
            QueryKind::Begin
        );
        // purely syntactic, so a multi-statement string is claimed too
        assert_eq!(
            classify(QueryKind::Query, "beginning; SELECT 1"),
            QueryKind::Begin
        );
    }

    #[test]
    fn test_classify_exact_matches() {
        assert_eq!(classify(QueryKind::Exec, "commit"), QueryKind::Commit);
        assert_eq!(classify(QueryKind::Exec, ";"), QueryKind::Ping);
        assert_eq!(classify(QueryKind::Exec, "commit;"), QueryKind::Exec);
        assert_eq!(classify(QueryKind::Exec, " ;"), QueryKind::Exec);
    }

    #[test]
    fn test_classify_is_case_sensitive() {
        assert_eq!(classify(QueryKind::Exec, "BEGIN"), QueryKind::Exec);
        assert_eq!(classify(QueryKind::Query, "COMMIT"), QueryKind::Query);
    }

    #[test]
    fn test_classify_keeps_default() {
        assert_eq!(classify(QueryKind::Query, "SELECT 1"), QueryKind::Query);
        assert_eq!(classify(QueryKind::Exec, "SELECT 1"), QueryKind::Exec);
        assert_eq!(classify(QueryKind::Exec, "rollback"), QueryKind::Exec);
        assert_eq!(classify(QueryKind::Exec, "savepoint sp_1"), QueryKind::Exec);
        assert_eq!(classify(QueryKind::Query, ""), QueryKind::Query);
    }

    #[test]
    fn test_query_kind_strings() {
        assert_eq!(QueryKind::CopyFrom.as_str(), "CopyFrom");
        assert_eq!(QueryKind::SendBatch.to_string(), "SendBatch");
    }

    #[test]
    fn test_sanitize_plain_identifier() {
        assert_eq!(Identifier::from("t").sanitize(), "t");
        assert_eq!(
            Identifier::new(["public", "user_events"]).sanitize(),
            "public.user_events"
        );
    }

    #[test]
    fn test_sanitize_quotes_when_needed() {
        assert_eq!(Identifier::from("Users").sanitize(), r#""Users""#);
        assert_eq!(Identifier::from("my table").sanitize(), r#""my table""#);
        assert_eq!(Identifier::from(r#"a"b"#).sanitize(), r#""a""b""#);
        assert_eq!(Identifier::from("bad\0name").sanitize(), "badname");
    }

    #[test]
    fn test_copy_from_resource() {
        assert_eq!(copy_from_resource(&Identifier::from("t")), "COPY t FROM stdin");
        assert_eq!(
            copy_from_resource(&Identifier::new(["audit", "Log"])),
            r#"COPY audit."Log" FROM stdin"#
        );
    }

    #[test]
    fn test_send_batch_resource() {
        assert_eq!(send_batch_resource(3), "send batch (len = 3)");
    }
}
