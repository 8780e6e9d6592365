//! SAGA Steps
//!
//! Each step is a unit of work against the ledger with an optional inverse.
//! Steps never return errors across their boundary: the orchestrator only sees
//! tagged outcomes and decides what happens next.

pub mod credit;
pub mod debit;
pub mod validation;

pub use credit::CreditStep;
pub use debit::DebitStep;
pub use validation::ValidationStep;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use super::error::LedgerError;
use super::types::{LedgerTxId, StepName, TransferAggregate};

/// Why a step did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    /// A business rule refused the transfer; the reason is caller-safe
    Rejected(String),
    /// Infrastructure failure before any effect was attempted
    Infra(LedgerError),
    /// The ledger call itself failed; ambiguous errors may have applied
    Execution(LedgerError),
}

impl StepFailure {
    /// Reason stored on the aggregate and returned to the caller
    pub fn reason(&self, step: StepName) -> String {
        match self {
            StepFailure::Rejected(reason) => reason.clone(),
            StepFailure::Infra(e) | StepFailure::Execution(e) => {
                format!("{} failed: {}", step.as_str().to_lowercase(), caller_safe(e))
            }
        }
    }
}

/// Result of a forward step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Done; effectful steps report the ledger tx
    Ok(Option<LedgerTxId>),
    Fail(StepFailure),
}

/// Result of undoing a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Compensated(LedgerTxId),
    NothingToCompensate,
    Failed(String),
}

/// One SAGA step
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> StepName;

    async fn execute(&self, transfer: &TransferAggregate) -> StepOutcome;

    /// Ask the ledger whether this step's forward mutation already landed
    async fn already_applied(
        &self,
        _transfer: &TransferAggregate,
    ) -> Result<Option<LedgerTxId>, LedgerError> {
        Ok(None)
    }

    async fn compensate(&self, _transfer: &TransferAggregate) -> CompensationOutcome {
        CompensationOutcome::NothingToCompensate
    }
}

/// Run a ledger call with an upper bound; elapsed maps to `LedgerError::Timeout`
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| LedgerError::Timeout)?
}

/// Ledger error text without balances or internal detail
fn caller_safe(e: &LedgerError) -> &'static str {
    match e {
        LedgerError::AccountNotFound(_) => "account not found",
        LedgerError::AccountInactive(_) => "account is not active",
        LedgerError::InsufficientFunds(_) => "insufficient funds",
        LedgerError::LockTimeout(_) => "account busy",
        LedgerError::LockNotHeld(_) => "account lock lost",
        LedgerError::Timeout => "ledger timeout",
        LedgerError::Unavailable(_) => "ledger unavailable",
    }
}
