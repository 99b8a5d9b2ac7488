//! Error types for traced connections and transactions.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted by [`Error::database`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by traced connections, transactions and savepoints.
///
/// Errors produced by the wrapped client travel in [`Error::Database`] and are
/// returned exactly as the client produced them. The other variants are raised
/// by the proxies themselves.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The transaction or savepoint already committed or rolled back.
    #[error("tx is closed")]
    TxClosed,

    /// `commit` was answered with a `ROLLBACK` command tag.
    #[error("commit unexpectedly resulted in rollback")]
    TxCommitRollback,

    /// Reason handed to the client when a failed rollback kills the connection.
    #[error("rollback failed: {0}")]
    RollbackFailed(#[source] Box<Error>),

    /// The connection has been closed.
    #[error("conn closed")]
    ConnClosed,

    /// Large objects cannot be reached through a traced transaction.
    #[error("large objects are not available on a traced transaction")]
    LargeObjectsUnavailable,

    /// Error reported by the wrapped database client.
    #[error("{0}")]
    Database(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap a client error.
    pub fn database(err: impl Into<BoxError>) -> Self {
        Self::Database(Arc::from(err.into()))
    }

    /// Whether this is [`Error::TxClosed`].
    pub fn is_tx_closed(&self) -> bool {
        matches!(self, Error::TxClosed)
    }
}

/// Result of running a unit of work inside a transaction or savepoint.
#[derive(Error, Debug)]
pub enum TransactionError<E> {
    /// Beginning, committing or rolling back failed.
    #[error("connection error: {0}")]
    Connection(Error),

    /// The unit of work returned an error and the transaction was rolled back.
    #[error("transaction error: {0}")]
    Transaction(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_keeps_message() {
        let err = Error::database("relation \"missing\" does not exist");
        assert_eq!(err.to_string(), "relation \"missing\" does not exist");
        assert!(!err.is_tx_closed());
    }

    #[test]
    fn test_rollback_failed_exposes_source() {
        use std::error::Error as _;

        let err = Error::RollbackFailed(Box::new(Error::ConnClosed));
        assert_eq!(err.to_string(), "rollback failed: conn closed");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_clone_shares_database_error() {
        let err = Error::database("boom");
        let cloned = err.clone();
        match (err, cloned) {
            (Error::Database(a), Error::Database(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected variants: {other:?}"),
        }
    }
}
