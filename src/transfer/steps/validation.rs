//! Validation step: read-only business checks
//!
//! Both accounts are read while their locks are held (acquired in global
//! order), so the checks see a consistent pair of snapshots. Rejection reasons
//! are safe to show a caller and never include balances.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{SagaStep, StepFailure, StepOutcome, bounded};
use crate::transfer::config::SagaConfig;
use crate::transfer::ledger::{AccountSnapshot, AccountStatus, LedgerClient};
use crate::transfer::types::{AccountId, StepName, TransferAggregate};

pub struct ValidationStep {
    ledger: Arc<dyn LedgerClient>,
    config: Arc<SagaConfig>,
}

impl ValidationStep {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: Arc<SagaConfig>) -> Self {
        Self { ledger, config }
    }

    async fn read(&self, id: &AccountId) -> Result<Option<AccountSnapshot>, StepFailure> {
        bounded(self.config.ledger_call_timeout(), self.ledger.get_account(id))
            .await
            .map_err(StepFailure::Infra)
    }

    async fn check(&self, t: &TransferAggregate) -> Result<(), StepFailure> {
        if t.source == t.destination {
            return Err(rejected("source and destination must differ"));
        }

        let (_source_lock, _destination_lock) = self
            .ledger
            .lock_pair(&t.source, &t.destination, self.config.lock_timeout())
            .await
            .map_err(StepFailure::Infra)?;

        let source = self
            .read(&t.source)
            .await?
            .ok_or_else(|| rejected("source account not found"))?;
        let destination = self
            .read(&t.destination)
            .await?
            .ok_or_else(|| rejected("destination account not found"))?;

        if source.status != AccountStatus::Active {
            return Err(rejected("source account is not active"));
        }
        if destination.status != AccountStatus::Active {
            return Err(rejected("destination account is not active"));
        }
        if source.currency != t.currency || destination.currency != t.currency {
            return Err(rejected("currency mismatch"));
        }
        if source.balance < t.amount + self.config.transfer_fee {
            return Err(rejected("insufficient funds"));
        }
        if let Some(limit) = self.config.max_transfer_amount
            && t.amount > limit
        {
            return Err(rejected("amount exceeds per-transfer limit"));
        }
        Ok(())
    }
}

fn rejected(reason: &str) -> StepFailure {
    StepFailure::Rejected(reason.to_string())
}

#[async_trait]
impl SagaStep for ValidationStep {
    fn name(&self) -> StepName {
        StepName::Validation
    }

    async fn execute(&self, transfer: &TransferAggregate) -> StepOutcome {
        match self.check(transfer).await {
            Ok(()) => {
                debug!(transfer_ref = %transfer.transfer_ref, "Validation passed");
                StepOutcome::Ok(None)
            }
            Err(failure) => {
                debug!(transfer_ref = %transfer.transfer_ref, failure = ?failure, "Validation did not pass");
                StepOutcome::Fail(failure)
            }
        }
    }
}
