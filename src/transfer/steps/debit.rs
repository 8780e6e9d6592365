//! Debit step: take the amount from the source account
//!
//! The balance is re-checked under the source lock because validation released
//! its locks before this step ran. Forward mutations are tagged with the
//! transfer reference, the reversal with `{transfer_ref}-COMP`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CompensationOutcome, SagaStep, StepFailure, StepOutcome, bounded};
use crate::transfer::config::SagaConfig;
use crate::transfer::error::LedgerError;
use crate::transfer::ledger::LedgerClient;
use crate::transfer::types::{LedgerTxId, MutationTag, StepName, TransferAggregate};

pub struct DebitStep {
    ledger: Arc<dyn LedgerClient>,
    config: Arc<SagaConfig>,
}

impl DebitStep {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: Arc<SagaConfig>) -> Self {
        Self { ledger, config }
    }

    async fn debit(&self, t: &TransferAggregate) -> Result<LedgerTxId, StepFailure> {
        let lock = self
            .ledger
            .lock(&t.source, self.config.lock_timeout())
            .await
            .map_err(StepFailure::Infra)?;

        let account = bounded(
            self.config.ledger_call_timeout(),
            self.ledger.get_account(&t.source),
        )
        .await
        .map_err(StepFailure::Infra)?
        .ok_or_else(|| StepFailure::Execution(LedgerError::AccountNotFound(t.source.clone())))?;
        if account.balance < t.amount {
            return Err(StepFailure::Execution(LedgerError::InsufficientFunds(
                t.source.clone(),
            )));
        }

        bounded(
            self.config.ledger_call_timeout(),
            self.ledger
                .debit(&lock, t.amount, &MutationTag::forward(t.transfer_ref)),
        )
        .await
        .map_err(StepFailure::Execution)
    }
}

#[async_trait]
impl SagaStep for DebitStep {
    fn name(&self) -> StepName {
        StepName::Debit
    }

    async fn execute(&self, transfer: &TransferAggregate) -> StepOutcome {
        match self.debit(transfer).await {
            Ok(tx_id) => {
                debug!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.source,
                    tx_id = %tx_id,
                    "Source debited"
                );
                StepOutcome::Ok(Some(tx_id))
            }
            Err(failure) => {
                warn!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.source,
                    failure = ?failure,
                    "Debit failed"
                );
                StepOutcome::Fail(failure)
            }
        }
    }

    async fn already_applied(
        &self,
        transfer: &TransferAggregate,
    ) -> Result<Option<LedgerTxId>, LedgerError> {
        bounded(
            self.config.ledger_call_timeout(),
            self.ledger
                .find_mutation(&transfer.source, &MutationTag::forward(transfer.transfer_ref)),
        )
        .await
    }

    /// Credit the source back
    async fn compensate(&self, transfer: &TransferAggregate) -> CompensationOutcome {
        match self.already_applied(transfer).await {
            Ok(Some(_)) => {}
            Ok(None) => return CompensationOutcome::NothingToCompensate,
            Err(e) => return CompensationOutcome::Failed(e.to_string()),
        }

        let lock = match self
            .ledger
            .lock(&transfer.source, self.config.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => return CompensationOutcome::Failed(e.to_string()),
        };

        let refund = bounded(
            self.config.ledger_call_timeout(),
            self.ledger.credit(
                &lock,
                transfer.amount,
                &MutationTag::compensation(transfer.transfer_ref),
            ),
        )
        .await;

        match refund {
            Ok(tx_id) => {
                info!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.source,
                    tx_id = %tx_id,
                    "Debit reversed"
                );
                CompensationOutcome::Compensated(tx_id)
            }
            Err(e) => CompensationOutcome::Failed(e.to_string()),
        }
    }
}
