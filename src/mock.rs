//! In-memory client, pool and span sink for tests.
//!
//! Enabled for this crate's own tests and, for downstream crates, behind the
//! `test-util` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::client::{
    Batch, BatchResults, CommandTag, CopyFromSource, FieldDescription, PgClient, PgPool, Row, Rows,
    StatementDescription, TxStatus, Value,
};
use crate::context::QueryContext;
use crate::error::Error;
use crate::logger::{LogData, LogLevel, QueryLogger};
use crate::parser::Identifier;
use crate::sink::{FinishOptions, StartSpanOptions, TagValue, TraceError, TraceSpan, Tracer};
use crate::trace::{QUERY_TYPE_TAG, RESOURCE_TAG};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn type_oid(value: &Value) -> u32 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 16,
        Value::Int(_) => 20,
        Value::Float(_) => 701,
        Value::Text(_) => 25,
        Value::Bytes(_) => 17,
    }
}

fn field_descriptions(names: &[&str], rows: &[Vec<Value>]) -> Vec<FieldDescription> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| FieldDescription {
            name: name.to_string(),
            data_type_oid: rows
                .first()
                .and_then(|row| row.get(i))
                .map_or(0, type_oid),
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
struct ResultSet {
    fields: Vec<FieldDescription>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct ClientState {
    statements: Vec<String>,
    calls: usize,
    failures: HashMap<String, Error>,
    command_tags: HashMap<String, String>,
    results: HashMap<String, ResultSet>,
    tx_status: TxStatus,
    closed: bool,
    died: Option<Error>,
}

impl ClientState {
    /// Record `sql` and reject it the way a server would.
    fn check(&mut self, sql: &str) -> Result<(), Error> {
        self.calls += 1;
        self.statements.push(sql.to_string());
        if self.closed {
            return Err(Error::ConnClosed);
        }
        if let Some(err) = self.failures.get(sql).cloned() {
            if self.tx_status == TxStatus::InTransaction {
                self.tx_status = TxStatus::InFailedTransaction;
            }
            return Err(err);
        }
        let ends_failure =
            sql == "commit" || sql == "rollback" || sql.starts_with("rollback to savepoint");
        if self.tx_status == TxStatus::InFailedTransaction && !ends_failure {
            return Err(Error::database(
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        Ok(())
    }

    fn exec(&mut self, sql: &str) -> Result<CommandTag, Error> {
        self.check(sql)?;

        let mut default_tag = sql
            .split_whitespace()
            .next()
            .filter(|word| *word != ";")
            .unwrap_or_default()
            .to_uppercase();
        if sql.starts_with("begin") {
            self.tx_status = TxStatus::InTransaction;
        } else if sql == "commit" {
            if self.tx_status == TxStatus::InFailedTransaction {
                default_tag = "ROLLBACK".to_string();
            }
            self.tx_status = TxStatus::Idle;
        } else if sql == "rollback" {
            self.tx_status = TxStatus::Idle;
        } else if sql.starts_with("rollback to savepoint") {
            self.tx_status = TxStatus::InTransaction;
        }

        let tag = self.command_tags.get(sql).cloned().unwrap_or(default_tag);
        Ok(CommandTag::new(tag))
    }

    fn result_set(&self, sql: &str) -> ResultSet {
        self.results.get(sql).cloned().unwrap_or_default()
    }
}

/// Scripted [`PgClient`].
///
/// Clones share the same state, so a test can keep a handle to the client it
/// gave to a traced connection. Statements succeed unless a failure was
/// registered with [`fail_on`](Self::fail_on); transaction status follows
/// `begin`, `commit` and `rollback` like a server would. A client built
/// with [`with_logger`](Self::with_logger) reports its `Exec`, `Query` and
/// `CopyFrom` calls to that logger.
pub struct MockClient {
    state: Arc<Mutex<ClientState>>,
    lease: Option<Arc<PoolCounters>>,
    logger: Option<Arc<dyn QueryLogger>>,
}

impl Clone for MockClient {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            lease: None,
            logger: self.logger.clone(),
        }
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        if let Some(lease) = &self.lease {
            lease.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("state", &*lock(&self.state))
            .field("logging", &self.logger.is_some())
            .finish()
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState::default())),
            lease: None,
            logger: None,
        }
    }

    /// Report calls to `logger` the way a logging driver does.
    pub fn with_logger(mut self, logger: impl QueryLogger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    fn log(&self, ctx: &QueryContext, msg: &str, data: LogData) {
        if let Some(logger) = &self.logger {
            let level = if data.err.is_some() {
                LogLevel::Error
            } else {
                LogLevel::Info
            };
            logger.log(ctx, level, msg, &data);
        }
    }

    /// Fail every statement whose text is exactly `sql`.
    pub fn fail_on(&self, sql: impl Into<String>, err: Error) {
        lock(&self.state).failures.insert(sql.into(), err);
    }

    /// Answer `sql` with `tag` instead of the default command tag.
    pub fn respond_with_tag(&self, sql: impl Into<String>, tag: impl Into<String>) {
        lock(&self.state).command_tags.insert(sql.into(), tag.into());
    }

    /// Answer queries of `sql` with `rows`.
    pub fn respond_with_rows(&self, sql: impl Into<String>, columns: &[&str], rows: Vec<Vec<Value>>) {
        let fields = field_descriptions(columns, &rows);
        lock(&self.state)
            .results
            .insert(sql.into(), ResultSet { fields, rows });
    }

    pub fn set_tx_status(&self, status: TxStatus) {
        lock(&self.state).tx_status = status;
    }

    /// Every statement sent so far, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).statements.clone()
    }

    /// Number of calls that reached the client.
    pub fn call_count(&self) -> usize {
        lock(&self.state).calls
    }

    /// Reason passed to [`PgClient::die`], if it was called.
    pub fn died(&self) -> Option<Error> {
        lock(&self.state).died.clone()
    }
}

#[async_trait]
impl PgClient for MockClient {
    async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        _params: &[Value],
    ) -> Result<CommandTag, Error> {
        let start = SystemTime::now();
        let result = lock(&self.state).exec(sql);
        let data = LogData::new().with_sql(sql).with_start_time(start);
        let data = match &result {
            Ok(tag) => data.with_command_tag(tag.clone()),
            Err(err) => data.with_err(err.clone()),
        };
        self.log(ctx, "Exec", data);
        result
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        _params: &[Value],
    ) -> Result<Box<dyn Rows>, Error> {
        let start = SystemTime::now();
        let result = {
            let mut state = lock(&self.state);
            state.check(sql).map(|_| state.result_set(sql))
        };
        let data = LogData::new().with_sql(sql).with_start_time(start);
        match result {
            Ok(ResultSet { fields, rows }) => {
                self.log(ctx, "Query", data.with_row_count(rows.len() as u64));
                Ok(Box::new(MockRows::from_parts(fields, rows)))
            }
            Err(err) => {
                self.log(ctx, "Query", data.with_err(err.clone()));
                Err(err)
            }
        }
    }

    async fn query_row(&self, _ctx: &QueryContext, sql: &str, _params: &[Value]) -> Box<dyn Row> {
        let mut state = lock(&self.state);
        let result = state.check(sql).and_then(|_| {
            state
                .result_set(sql)
                .rows
                .into_iter()
                .next()
                .ok_or_else(|| Error::database("no rows in result set"))
        });
        Box::new(MockRow::new(result))
    }

    async fn copy_from(
        &self,
        ctx: &QueryContext,
        table: &Identifier,
        columns: &[String],
        source: &mut dyn CopyFromSource,
    ) -> Result<u64, Error> {
        let start = SystemTime::now();
        let statement = format!(
            "COPY {} ({}) FROM stdin",
            table.sanitize(),
            columns.join(", ")
        );
        let result = lock(&self.state).check(&statement).and_then(|_| {
            let mut copied = 0;
            while let Some(row) = source.next_row() {
                row?;
                copied += 1;
            }
            Ok(copied)
        });

        let data = LogData::new()
            .with_table_name(table.sanitize())
            .with_column_names(columns.iter().cloned())
            .with_start_time(start);
        let data = match &result {
            Ok(copied) => data.with_row_count(*copied),
            Err(err) => data.with_err(err.clone()),
        };
        self.log(ctx, "CopyFrom", data);
        result
    }

    async fn prepare(
        &self,
        _ctx: &QueryContext,
        name: &str,
        sql: &str,
    ) -> Result<StatementDescription, Error> {
        let mut state = lock(&self.state);
        state.calls += 1;
        if state.closed {
            return Err(Error::ConnClosed);
        }
        if let Some(err) = state.failures.get(sql).cloned() {
            return Err(err);
        }
        Ok(StatementDescription {
            name: name.to_string(),
            sql: sql.to_string(),
            param_oids: Vec::new(),
            fields: state.result_set(sql).fields,
        })
    }

    async fn deallocate(&self, _ctx: &QueryContext, _name: &str) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.calls += 1;
        if state.closed {
            return Err(Error::ConnClosed);
        }
        Ok(())
    }

    async fn send_batch(&self, _ctx: &QueryContext, batch: Batch) -> Box<dyn BatchResults> {
        let mut state = lock(&self.state);
        // the batch itself counts as one call
        state.calls += 1;
        let results = batch
            .queued()
            .iter()
            .map(|query| {
                let tag = state.exec(&query.sql);
                state.calls -= 1;
                tag.map(|tag| (tag, state.result_set(&query.sql)))
            })
            .collect();
        Box::new(MockBatchResults { results })
    }

    async fn close(&self, _ctx: &QueryContext) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.calls += 1;
        state.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn tx_status(&self) -> TxStatus {
        lock(&self.state).tx_status
    }

    fn die(&self, reason: Error) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.died = Some(reason);
    }
}

/// In-memory result set.
#[derive(Debug)]
pub struct MockRows {
    fields: Vec<FieldDescription>,
    rows: Vec<Vec<Value>>,
    position: usize,
    current: Option<Vec<Value>>,
    closed: bool,
}

impl MockRows {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::from_parts(field_descriptions(columns, &rows), rows)
    }

    fn from_parts(fields: Vec<FieldDescription>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            fields,
            rows,
            position: 0,
            current: None,
            closed: false,
        }
    }
}

#[async_trait]
impl Rows for MockRows {
    async fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match self.rows.get(self.position) {
            Some(row) => {
                self.current = Some(row.clone());
                self.position += 1;
                true
            }
            None => {
                self.current = None;
                self.closed = true;
                false
            }
        }
    }

    fn values(&self) -> Result<Vec<Value>, Error> {
        self.current
            .clone()
            .ok_or_else(|| Error::database("no current row"))
    }

    fn raw_values(&self) -> Vec<Option<Vec<u8>>> {
        self.current
            .iter()
            .flatten()
            .map(Value::to_text_bytes)
            .collect()
    }

    fn field_descriptions(&self) -> &[FieldDescription] {
        &self.fields
    }

    fn err(&self) -> Option<Error> {
        None
    }

    fn command_tag(&self) -> CommandTag {
        CommandTag::new(format!("SELECT {}", self.rows.len()))
    }

    fn close(&mut self) {
        self.current = None;
        self.closed = true;
    }
}

/// Single row holding a fixed scan result.
#[derive(Debug)]
pub struct MockRow {
    result: Result<Vec<Value>, Error>,
}

impl MockRow {
    pub fn new(result: Result<Vec<Value>, Error>) -> Self {
        Self { result }
    }
}

#[async_trait]
impl Row for MockRow {
    async fn scan(self: Box<Self>) -> Result<Vec<Value>, Error> {
        self.result
    }
}

/// Results of a batch run by [`MockClient`], computed when the batch was sent.
#[derive(Debug)]
pub struct MockBatchResults {
    results: VecDeque<Result<(CommandTag, ResultSet), Error>>,
}

impl MockBatchResults {
    fn next_result(&mut self) -> Result<(CommandTag, ResultSet), Error> {
        self.results
            .pop_front()
            .unwrap_or_else(|| Err(Error::database("no more results in batch")))
    }
}

#[async_trait]
impl BatchResults for MockBatchResults {
    async fn exec(&mut self) -> Result<CommandTag, Error> {
        self.next_result().map(|(tag, _)| tag)
    }

    async fn query(&mut self) -> Result<Box<dyn Rows>, Error> {
        let (_, set) = self.next_result()?;
        Ok(Box::new(MockRows::from_parts(set.fields, set.rows)))
    }

    async fn query_row(&mut self) -> Box<dyn Row> {
        let result = self.next_result().and_then(|(_, set)| {
            set.rows
                .into_iter()
                .next()
                .ok_or_else(|| Error::database("no rows in result set"))
        });
        Box::new(MockRow::new(result))
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        self.results
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// [`PgPool`] handing out [`MockClient`]s that share one scripted state.
#[derive(Debug, Clone, Default)]
pub struct MockPool {
    client: MockClient,
    counters: Arc<PoolCounters>,
    closed: Arc<AtomicBool>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared client state, for scripting responses.
    pub fn client(&self) -> &MockClient {
        &self.client
    }

    pub fn fail_on(&self, sql: impl Into<String>, err: Error) {
        self.client.fail_on(sql, err);
    }

    pub fn statements(&self) -> Vec<String> {
        self.client.statements()
    }

    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PgPool for MockPool {
    type Client = MockClient;

    async fn acquire(&self, _ctx: &QueryContext) -> Result<MockClient, Error> {
        if self.is_closed() {
            return Err(Error::ConnClosed);
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            state: Arc::clone(&self.client.state),
            lease: Some(Arc::clone(&self.counters)),
            logger: self.client.logger.clone(),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A message received by [`MockLogger`].
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub level: LogLevel,
    pub msg: String,
    pub data: LogData,
}

/// [`QueryLogger`] that records every message in memory.
#[derive(Debug, Clone, Default)]
pub struct MockLogger {
    logged: Arc<Mutex<Vec<LoggedMessage>>>,
}

impl MockLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level and text of every message, in order.
    pub fn messages(&self) -> Vec<(LogLevel, String)> {
        lock(&self.logged)
            .iter()
            .map(|logged| (logged.level, logged.msg.clone()))
            .collect()
    }

    pub fn logged(&self) -> Vec<LoggedMessage> {
        lock(&self.logged).clone()
    }
}

impl QueryLogger for MockLogger {
    fn log(&self, _ctx: &QueryContext, level: LogLevel, msg: &str, data: &LogData) {
        lock(&self.logged).push(LoggedMessage {
            level,
            msg: msg.to_string(),
            data: data.clone(),
        });
    }
}

/// A span recorded by [`MockTracer`].
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub operation_name: String,
    pub service_name: String,
    pub span_type: &'static str,
    pub start_time: SystemTime,
    pub finish_time: SystemTime,
    pub tags: Vec<(String, TagValue)>,
    pub error: Option<String>,
}

impl FinishedSpan {
    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn tag_str(&self, key: &str) -> Option<&str> {
        self.tag(key).and_then(TagValue::as_str)
    }

    pub fn query_kind(&self) -> Option<&str> {
        self.tag_str(QUERY_TYPE_TAG)
    }

    pub fn resource(&self) -> Option<&str> {
        self.tag_str(RESOURCE_TAG)
    }
}

#[derive(Debug, Default)]
struct TracerState {
    finished: Vec<FinishedSpan>,
    reject: bool,
}

/// [`Tracer`] that records finished spans in memory.
#[derive(Debug, Clone, Default)]
pub struct MockTracer {
    state: Arc<Mutex<TracerState>>,
}

impl MockTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished spans, in finish order.
    pub fn finished_spans(&self) -> Vec<FinishedSpan> {
        lock(&self.state).finished.clone()
    }

    pub fn reset(&self) {
        lock(&self.state).finished.clear();
    }

    /// Make `start_span` fail, simulating a broken sink.
    pub fn reject_spans(&self, reject: bool) {
        lock(&self.state).reject = reject;
    }
}

impl Tracer for MockTracer {
    fn start_span(
        &self,
        operation_name: &str,
        options: StartSpanOptions,
    ) -> Result<Box<dyn TraceSpan>, TraceError> {
        if lock(&self.state).reject {
            return Err(TraceError("tracer rejected span".to_string()));
        }
        Ok(Box::new(MockSpan {
            state: Arc::clone(&self.state),
            span: FinishedSpan {
                operation_name: operation_name.to_string(),
                service_name: options.service_name,
                span_type: options.span_type,
                start_time: options.start_time,
                finish_time: options.start_time,
                tags: options.tags,
                error: None,
            },
        }))
    }
}

struct MockSpan {
    state: Arc<Mutex<TracerState>>,
    span: FinishedSpan,
}

impl TraceSpan for MockSpan {
    fn set_tag(&mut self, key: &str, value: TagValue) {
        match self.span.tags.iter_mut().find(|(name, _)| name == key) {
            Some((_, existing)) => *existing = value,
            None => self.span.tags.push((key.to_string(), value)),
        }
    }

    fn finish(self: Box<Self>, options: FinishOptions<'_>) -> Result<(), TraceError> {
        let MockSpan { state, mut span } = *self;
        span.finish_time = options.finish_time.unwrap_or_else(SystemTime::now);
        span.error = options.error.map(ToString::to_string);
        lock(&state).finished.push(span);
        Ok(())
    }
}
