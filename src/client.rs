//! Capabilities of the wrapped PostgreSQL client.
//!
//! Connection establishment, the wire protocol and row decoding belong to the
//! client; the proxies in this crate only need the operations below.

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::Error;
use crate::parser::Identifier;

/// A query parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Text-format encoding of the value, `None` for SQL `NULL`.
    pub fn to_text_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { b"t".to_vec() } else { b"f".to_vec() }),
            Value::Int(i) => Some(i.to_string().into_bytes()),
            Value::Float(f) => Some(f.to_string().into_bytes()),
            Value::Text(s) => Some(s.clone().into_bytes()),
            Value::Bytes(b) => Some(b.clone()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Command tag returned by the server for a completed statement, e.g. `INSERT 0 3`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rows affected, taken from the tag's trailing number (0 when absent).
    pub fn rows_affected(&self) -> u64 {
        self.0
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub data_type_oid: u32,
}

/// Description of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementDescription {
    pub name: String,
    pub sql: String,
    pub param_oids: Vec<u32>,
    pub fields: Vec<FieldDescription>,
}

/// Transaction status reported by the server after the last statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; statements are rejected until rollback.
    InFailedTransaction,
}

/// One statement queued on a [`Batch`].
#[derive(Debug, Clone)]
pub struct QueuedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Statements sent to the server in one round trip.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    queued: Vec<QueuedQuery>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a statement.
    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<Value>) {
        self.queued.push(QueuedQuery {
            sql: sql.into(),
            params,
        });
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn queued(&self) -> &[QueuedQuery] {
        &self.queued
    }
}

/// Rows fed to `copy_from`.
pub trait CopyFromSource: Send {
    /// The next row, `None` when exhausted.
    fn next_row(&mut self) -> Option<Result<Vec<Value>, Error>>;
}

/// [`CopyFromSource`] over rows held in memory.
#[derive(Debug)]
pub struct CopyFromRows {
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl CopyFromRows {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl CopyFromSource for CopyFromRows {
    fn next_row(&mut self) -> Option<Result<Vec<Value>, Error>> {
        self.rows.next().map(Ok)
    }
}

/// A multi-row result set.
#[async_trait]
pub trait Rows: Send {
    /// Advance to the next row; `false` when exhausted or failed.
    async fn next(&mut self) -> bool;

    /// Decoded values of the current row.
    fn values(&self) -> Result<Vec<Value>, Error>;

    /// Raw text-format values of the current row.
    fn raw_values(&self) -> Vec<Option<Vec<u8>>>;

    fn field_descriptions(&self) -> &[FieldDescription];

    /// Error that ended iteration, if any.
    fn err(&self) -> Option<Error>;

    /// Command tag, available once the rows are exhausted or closed.
    fn command_tag(&self) -> CommandTag;

    fn close(&mut self);
}

/// Result of a single-row query. Errors surface when the row is scanned.
#[async_trait]
pub trait Row: Send {
    async fn scan(self: Box<Self>) -> Result<Vec<Value>, Error>;
}

/// Results of a sent [`Batch`], read in queue order.
#[async_trait]
pub trait BatchResults: Send {
    async fn exec(&mut self) -> Result<CommandTag, Error>;

    async fn query(&mut self) -> Result<Box<dyn Rows>, Error>;

    async fn query_row(&mut self) -> Box<dyn Row>;

    /// Discard unread results, returning the first error among them.
    async fn close(self: Box<Self>) -> Result<(), Error>;
}

/// A live PostgreSQL connection.
#[async_trait]
pub trait PgClient: Send + Sync {
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<CommandTag, Error>;

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>, Error>;

    async fn query_row(&self, ctx: &QueryContext, sql: &str, params: &[Value]) -> Box<dyn Row>;

    /// Bulk load rows with the COPY protocol, returning the number copied.
    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error>;

    async fn prepare(
        &self,
        ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error>;

    async fn deallocate(&self, ctx: &QueryContext, name: &str) -> Result<(), Error>;

    async fn send_batch(&self, ctx: &QueryContext, batch: Batch) -> Box<dyn BatchResults>;

    /// Close the connection gracefully.
    async fn close(&self, ctx: &QueryContext) -> Result<(), Error>;

    fn is_closed(&self) -> bool;

    fn tx_status(&self) -> TxStatus;

    /// Tear the connection down without waiting; it must not be reused.
    fn die(&self, reason: Error);
}

/// A pool handing out [`PgClient`]s. Dropping a client returns it to the pool.
#[async_trait]
pub trait PgPool: Send + Sync {
    type Client: PgClient + 'static;

    async fn acquire(&self, ctx: &QueryContext) -> Result<Self::Client, Error>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tag_rows_affected() {
        assert_eq!(CommandTag::new("INSERT 0 3").rows_affected(), 3);
        assert_eq!(CommandTag::new("UPDATE 12").rows_affected(), 12);
        assert_eq!(CommandTag::new("BEGIN").rows_affected(), 0);
        assert_eq!(CommandTag::default().rows_affected(), 0);
    }

    #[test]
    fn test_value_text_encoding() {
        assert_eq!(Value::Null.to_text_bytes(), None);
        assert_eq!(Value::from(true).to_text_bytes(), Some(b"t".to_vec()));
        assert_eq!(Value::from(42).to_text_bytes(), Some(b"42".to_vec()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("ok")), Value::Text("ok".into()));
    }

    #[test]
    fn test_batch_queue() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.queue("INSERT INTO t VALUES ($1)", vec![1.into()]);
        batch.queue("SELECT count(*) FROM t", vec![]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.queued()[1].sql, "SELECT count(*) FROM t");
    }

    #[test]
    fn test_copy_from_rows() {
        let mut source = CopyFromRows::new(vec![vec![1.into()], vec![2.into()]]);
        assert_eq!(source.next_row().unwrap().unwrap(), vec![Value::Int(1)]);
        assert!(source.next_row().is_some());
        assert!(source.next_row().is_none());
    }
}
