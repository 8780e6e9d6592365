//! Credit step: add the amount to the destination account

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CompensationOutcome, SagaStep, StepFailure, StepOutcome, bounded};
use crate::transfer::config::SagaConfig;
use crate::transfer::error::LedgerError;
use crate::transfer::ledger::LedgerClient;
use crate::transfer::types::{LedgerTxId, MutationTag, StepName, TransferAggregate};

pub struct CreditStep {
    ledger: Arc<dyn LedgerClient>,
    config: Arc<SagaConfig>,
}

impl CreditStep {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: Arc<SagaConfig>) -> Self {
        Self { ledger, config }
    }
}

#[async_trait]
impl SagaStep for CreditStep {
    fn name(&self) -> StepName {
        StepName::Credit
    }

    async fn execute(&self, transfer: &TransferAggregate) -> StepOutcome {
        let lock = match self
            .ledger
            .lock(&transfer.destination, self.config.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => return StepOutcome::Fail(StepFailure::Infra(e)),
        };

        let credited = bounded(
            self.config.ledger_call_timeout(),
            self.ledger.credit(
                &lock,
                transfer.amount,
                &MutationTag::forward(transfer.transfer_ref),
            ),
        )
        .await;

        match credited {
            Ok(tx_id) => {
                debug!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.destination,
                    tx_id = %tx_id,
                    "Destination credited"
                );
                StepOutcome::Ok(Some(tx_id))
            }
            Err(e) => {
                warn!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.destination,
                    error = %e,
                    ambiguous = e.is_ambiguous(),
                    "Credit failed"
                );
                StepOutcome::Fail(StepFailure::Execution(e))
            }
        }
    }

    async fn already_applied(
        &self,
        transfer: &TransferAggregate,
    ) -> Result<Option<LedgerTxId>, LedgerError> {
        bounded(
            self.config.ledger_call_timeout(),
            self.ledger.find_mutation(
                &transfer.destination,
                &MutationTag::forward(transfer.transfer_ref),
            ),
        )
        .await
    }

    /// Debit the destination back
    async fn compensate(&self, transfer: &TransferAggregate) -> CompensationOutcome {
        match self.already_applied(transfer).await {
            Ok(Some(_)) => {}
            Ok(None) => return CompensationOutcome::NothingToCompensate,
            Err(e) => return CompensationOutcome::Failed(e.to_string()),
        }

        let lock = match self
            .ledger
            .lock(&transfer.destination, self.config.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => return CompensationOutcome::Failed(e.to_string()),
        };

        let reversal = bounded(
            self.config.ledger_call_timeout(),
            self.ledger.debit(
                &lock,
                transfer.amount,
                &MutationTag::compensation(transfer.transfer_ref),
            ),
        )
        .await;

        match reversal {
            Ok(tx_id) => {
                info!(
                    transfer_ref = %transfer.transfer_ref,
                    account = %transfer.destination,
                    tx_id = %tx_id,
                    "Credit reversed"
                );
                CompensationOutcome::Compensated(tx_id)
            }
            Err(e) => CompensationOutcome::Failed(e.to_string()),
        }
    }
}
