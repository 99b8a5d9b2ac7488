//! Basic example showing how to use pg-tracing.
//!
//! Run with: cargo run --example basic --features test-util
//!
//! Uses the in-memory client so it runs without a database; swap in any
//! `PgClient` implementation for real use.

use std::collections::BTreeMap;

use pg_tracing::mock::MockClient;
use pg_tracing::prelude::*;
use pg_tracing::{Batch, EventLogger, IsolationLevel, PgClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pg_tracing=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = MockClient::new();
    client.respond_with_rows(
        "SELECT id, email FROM users",
        &["id", "email"],
        vec![
            vec![1.into(), "ann@example.com".into()],
            vec![2.into(), "bob@example.com".into()],
        ],
    );

    // Option 1: Simple wrapping with defaults
    // let conn = TracedConn::wrap(client);

    // Option 2: Using the extension trait
    // let conn = client.with_tracing();

    // Option 3: With custom configuration, environment defaults first
    let conn = client.with_tracing_config(
        TracingConfig::from_env()
            .with_service_name("users-db")
            .with_analytics(true)
            .with_span_tags(BTreeMap::from([("env", "demo")])),
    );

    // Per-call tags travel with the call
    let ctx = QueryContext::new().with_span_tag("request_id", "req-42");

    conn.ping(&ctx).await?;

    let mut rows = conn.query(&ctx, "SELECT id, email FROM users", &[]).await?;
    while rows.next().await {
        tracing::info!(row = ?rows.values()?, "Fetched user");
    }

    let options = TxOptions::new().with_isolation_level(IsolationLevel::Serializable);
    let count = conn
        .begin_tx_func(&ctx, &options, |tx| {
            Box::pin(async move {
                let ctx = QueryContext::new();
                let tag = tx
                    .exec(&ctx, "UPDATE users SET active = $1", &[true.into()])
                    .await?;

                // Nested work runs in a savepoint
                tx.begin_func(&ctx, |sp| {
                    Box::pin(async move {
                        sp.exec(&QueryContext::new(), "DELETE FROM sessions", &[])
                            .await
                    })
                })
                .await
                .map_err(|err| Error::database(err.to_string()))?;

                Ok::<_, Error>(tag.rows_affected())
            })
        })
        .await?;
    tracing::info!(count, "Transaction committed");

    let mut batch = Batch::new();
    batch.queue("INSERT INTO audit VALUES ($1)", vec!["login".into()]);
    batch.queue("INSERT INTO audit VALUES ($1)", vec!["logout".into()]);
    let mut results = conn.send_batch(&ctx, batch).await;
    results.exec().await?;
    results.close().await?;

    // Drivers that only report calls through a logging hook
    let logged = MockClient::new().with_logger(TracingLogger::new(
        EventLogger,
        TracingConfig::from_env().with_service_name("users-db"),
    ));
    logged.exec(&ctx, "VACUUM users", &[]).await?;

    Ok(())
}
