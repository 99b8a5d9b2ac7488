//! # pg-tracing
//!
//! Span-based tracing for PostgreSQL client connections, pools and transactions.
//!
//! This crate wraps a PostgreSQL client and reports one span for every call
//! that reaches the server. Results and errors are returned exactly as the
//! client produced them; tracing never changes what the caller sees.
//!
//! ## Features
//!
//! - **Connection and Pool Wrappers**: `TracedConn` and `TracedPool` trace every statement
//! - **Transactions and Savepoints**: `begin`, `commit` and `rollback` are traced; nested
//!   transactions use savepoints named `sp_1`, `sp_2`, ...
//! - **Deferred Spans**: single-row queries are traced when scanned, batches when closed
//! - **Query Classification**: `begin`, `commit` and `;` are recognised from the statement text
//! - **Per-call Tags**: attach request-scoped tags through `QueryContext`
//! - **Pluggable Sink**: spans go to the `tracing` crate by default, or to any `Tracer`
//! - **Logger Hook**: `TracingLogger` traces the calls a driver reports through a `QueryLogger`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pg_tracing::prelude::*;
//!
//! // Wrap your existing client
//! let conn = TracedConn::wrap(client);
//! let ctx = QueryContext::new();
//!
//! conn.exec(&ctx, "UPDATE users SET active = $1", &[true.into()]).await?;
//!
//! // Run a unit of work in a transaction
//! conn.begin_func(&ctx, |tx| {
//!     Box::pin(async move {
//!         tx.exec(&QueryContext::new(), "DELETE FROM sessions", &[]).await?;
//!         Ok::<_, Error>(())
//!     })
//! })
//! .await?;
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! use pg_tracing::{TracedConn, TracingConfig, TracingOption};
//!
//! let conn = TracedConn::with_options(client, [
//!     TracingOption::ServiceName("orders-db".into()),
//!     TracingOption::AnalyticsRate(0.2),
//! ]);
//! ```
//!
//! ## Span Tags
//!
//! | Tag | Description |
//! |-----|-------------|
//! | `sql.query_type` | Query kind (`Exec`, `Query`, `Begin`, `Commit`, ...) |
//! | `resource.name` | Query text, or a synthetic resource such as `COPY t FROM stdin` |
//! | `analytics.sample_rate` | Configured sample rate (only when analytics is enabled) |
//! | `pg.command_tag`, `pg.row_count`, `pg.table_name`, `pg.column_names` | Call details, on spans from `TracingLogger` |
//! | *configured tags* | Tags from `TracingConfig::span_tags` |
//! | *context tags* | Tags from the call's `QueryContext` |

mod batch;
mod client;
mod config;
mod connection;
mod context;
mod error;
mod logger;
mod parser;
mod pool;
mod rows;
mod savepoint;
mod sink;
mod trace;
mod tx;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use batch::{ClosedBatchResults, TracedBatchResults};
pub use client::{
    Batch, BatchResults, CommandTag, CopyFromRows, CopyFromSource, FieldDescription, PgClient,
    PgPool, QueuedQuery, Row, Rows, StatementDescription, TxStatus, Value,
};
pub use config::{TracingConfig, TracingOption, DEFAULT_OPERATION_NAME, DEFAULT_SERVICE_NAME};
pub use connection::{Executor, TracedConn, TracingExt};
pub use context::QueryContext;
pub use error::{BoxError, Error, TransactionError};
pub use logger::{
    EventLogger, LogData, LogLevel, QueryLogger, TracingLogger, COLUMN_NAMES_TAG, COMMAND_TAG_TAG,
    ROW_COUNT_TAG, TABLE_NAME_TAG, TRACED_MESSAGES,
};
pub use parser::{classify, copy_from_resource, send_batch_resource, Identifier, QueryKind};
pub use pool::TracedPool;
pub use rows::{ClosedRow, TracedRow, TracedRows};
pub use savepoint::Savepoint;
pub use sink::{
    FinishOptions, StartSpanOptions, TagValue, TraceError, TraceSpan, Tracer, TracingTracer,
    SPAN_TYPE_SQL,
};
pub use trace::{trace_query, TraceQueryParams, ANALYTICS_RATE_TAG, QUERY_TYPE_TAG, RESOURCE_TAG};
pub use tx::{DeferrableMode, LargeObjects, TracedTx, Transaction, TxOptions};

/// Re-exported so callers can build [`TxOptions`] without depending on sea-orm directly.
pub use sea_orm::{AccessMode, IsolationLevel};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Error, Executor, QueryContext, QueryLogger, TracedConn, TracedPool, TracedTx, Transaction,
        TracingConfig, TracingExt, TracingLogger, TracingOption, TxOptions,
    };
}
