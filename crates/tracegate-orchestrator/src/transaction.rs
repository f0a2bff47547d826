//! Binds a request's storage transaction to its final outcome.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tracegate_trace::{DisclosureLevel, ErrorTrace};

use crate::outcome::Outcome;
use crate::telemetry::OrchestratorTelemetry;

/// One open storage transaction, owned by exactly one request.
///
/// Both methods may block; the coordinator calls them off the async
/// executor.
pub trait StorageTransaction: Send + Sync + 'static {
    #[allow(clippy::missing_errors_doc)]
    fn commit(&self) -> Result<(), ErrorTrace>;

    /// Must succeed as a no-op when the transaction is already closed.
    #[allow(clippy::missing_errors_doc)]
    fn rollback(&self) -> Result<(), ErrorTrace>;
}

pub trait TransactionSource: Send + Sync + 'static {
    type Transaction: StorageTransaction;

    #[allow(clippy::missing_errors_doc)]
    fn begin(&self) -> Result<Self::Transaction, ErrorTrace>;
}

/// Source for deployments without storage. Every route that asks for a
/// transaction fails before its handler runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStorage;

#[derive(Debug)]
pub enum NoTransaction {}

impl StorageTransaction for NoTransaction {
    fn commit(&self) -> Result<(), ErrorTrace> {
        match *self {}
    }

    fn rollback(&self) -> Result<(), ErrorTrace> {
        match *self {}
    }
}

impl TransactionSource for NoStorage {
    type Transaction = NoTransaction;

    fn begin(&self) -> Result<NoTransaction, ErrorTrace> {
        Err(ErrorTrace::new()
            .append(DisclosureLevel::Debug, "route requires storage but none is configured")
            .append(DisclosureLevel::Plain, "Database error"))
    }
}

pub struct TransactionCoordinator<T> {
    transaction: Option<Arc<T>>,
}

impl<T> std::fmt::Debug for TransactionCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("has_transaction", &self.transaction.is_some())
            .finish()
    }
}

impl<T: StorageTransaction> TransactionCoordinator<T> {
    /// A coordinator for routes that declared no storage need.
    #[must_use]
    pub fn detached() -> Self {
        Self { transaction: None }
    }

    /// Opens a transaction from `source` on the blocking pool.
    ///
    /// # Errors
    /// Returns the source's trace when the transaction cannot be opened.
    pub async fn begin<S>(source: &Arc<S>) -> Result<Self, ErrorTrace>
    where
        S: TransactionSource<Transaction = T>,
    {
        let source = Arc::clone(source);
        match tokio::task::spawn_blocking(move || source.begin()).await {
            Ok(Ok(transaction)) => Ok(Self { transaction: Some(Arc::new(transaction)) }),
            Ok(Err(trace)) => Err(trace),
            Err(err) => Err(ErrorTrace::new()
                .append_error(DisclosureLevel::Debug, &err)
                .append(DisclosureLevel::Wordy, "Could not begin transaction")
                .alt(DisclosureLevel::Plain, "Database error")),
        }
    }

    #[must_use]
    pub fn transaction(&self) -> Option<Arc<T>> {
        self.transaction.clone()
    }

    /// Commits on success and rolls back otherwise.
    ///
    /// A failed commit turns the outcome into an internal failure. A failed
    /// rollback is logged and never replaces the cause already reported.
    /// An abandoned request waits at most `rollback_budget` for its rollback;
    /// past that the outcome resolves while the rollback finishes on the
    /// blocking pool.
    pub async fn finalize(
        self,
        outcome: Outcome,
        telemetry: &OrchestratorTelemetry,
        rollback_budget: Duration,
    ) -> Outcome {
        let Some(transaction) = self.transaction else {
            return outcome;
        };

        match outcome {
            Outcome::Responded(reply) => {
                match run_blocking(transaction, "commit", |tx| tx.commit()).await {
                    Ok(()) => {
                        telemetry.record_commit();
                        Outcome::Responded(reply)
                    }
                    Err(trace) => {
                        telemetry.record_commit_failure();
                        Outcome::Failed(
                            trace
                                .with_status(StatusCode::INTERNAL_SERVER_ERROR)
                                .append(DisclosureLevel::Wordy, "Could not commit transaction")
                                .alt(DisclosureLevel::Plain, "Could not save changes"),
                        )
                    }
                }
            }
            failed @ (Outcome::Failed(_) | Outcome::TimedOut(_)) => {
                let budget =
                    if matches!(failed, Outcome::TimedOut(_)) { rollback_budget } else { Duration::MAX };
                let rollback = run_blocking(transaction, "roll back", |tx| tx.rollback());
                match tokio::time::timeout(budget, rollback).await {
                    Ok(Ok(())) => telemetry.record_rollback(),
                    Ok(Err(trace)) => {
                        telemetry.record_rollback_failure();
                        tracing::error!(
                            error = %trace.serialize(DisclosureLevel::Debug),
                            "rollback failed"
                        );
                    }
                    Err(_) => {
                        telemetry.record_rollback_failure();
                        tracing::warn!(
                            budget_ms = budget.as_millis(),
                            "rollback still running after its budget; resolving without it"
                        );
                    }
                }
                failed
            }
        }
    }
}

async fn run_blocking<T, F>(transaction: Arc<T>, action: &'static str, op: F) -> Result<(), ErrorTrace>
where
    T: StorageTransaction,
    F: FnOnce(&T) -> Result<(), ErrorTrace> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(&transaction)).await {
        Ok(result) => result,
        Err(err) => Err(ErrorTrace::new()
            .append_error(DisclosureLevel::Debug, &err)
            .append(DisclosureLevel::Wordy, format!("Could not {action} transaction"))),
    }
}
