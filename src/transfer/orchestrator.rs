//! Transfer Orchestrator
//!
//! Drives a transfer aggregate through the SAGA state machine. This is the
//! central component: it owns the transition order, the durable write barrier
//! after every transition and the compensation policy.
//!
//! # Rules
//!
//! 1. **Persist-Before-Call**: the pending state of an effectful step is saved
//!    before the ledger is called
//! 2. **CAS**: every save names the version it replaces; the loser of a race
//!    stops and re-reads
//! 3. **Look-Before-Replay**: before (re)running a step the ledger is asked
//!    whether a mutation tagged with this transfer already exists
//! 4. **Reverse Compensation**: executed steps are undone newest first; a
//!    failed undo terminates in FAILED with `reconciliation_required`

use dashmap::DashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::config::SagaConfig;
use super::error::{StoreError, TransferError};
use super::events::{EventPublisher, TransferEvent, TransferEventKind};
use super::idempotency::{GuardDecision, IdempotencyGuard, IdempotencyStore};
use super::ledger::LedgerClient;
use super::state::TransferStatus;
use super::steps::{
    CompensationOutcome, CreditStep, DebitStep, SagaStep, StepFailure, StepOutcome, ValidationStep,
};
use super::store::StateStore;
use super::types::{
    StepName, TransferAggregate, TransferRef, TransferRequest, TransferResult, TransferStatusView,
};

/// Failure reason recorded for client cancellations
pub const CANCELLED_REASON: &str = "cancelled by client";

/// Transfer Orchestrator - runs each transfer to a terminal state
pub struct TransferOrchestrator {
    store: Arc<dyn StateStore>,
    publisher: Arc<dyn EventPublisher>,
    guard: IdempotencyGuard,
    config: Arc<SagaConfig>,
    validation: ValidationStep,
    debit: DebitStep,
    credit: CreditStep,
    /// Cancellation requests for transfers past VALIDATING
    cancellations: DashSet<TransferRef>,
}

impl TransferOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn LedgerClient>,
        idempotency: Arc<dyn IdempotencyStore>,
        publisher: Arc<dyn EventPublisher>,
        config: SagaConfig,
    ) -> Self {
        let config = Arc::new(config);
        let guard = IdempotencyGuard::new(
            idempotency,
            config.in_flight_ttl(),
            config.idempotency_ttl(),
        );
        Self {
            validation: ValidationStep::new(ledger.clone(), config.clone()),
            debit: DebitStep::new(ledger.clone(), config.clone()),
            credit: CreditStep::new(ledger, config.clone()),
            store,
            publisher,
            guard,
            config,
            cancellations: DashSet::new(),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Access to the store for the recovery worker
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Start a transfer and run it to a terminal state
    ///
    /// A retried request with the same client key returns the stored result
    /// and never re-executes side effects.
    ///
    /// # Errors
    /// * Validation errors for malformed requests (nothing is persisted)
    /// * `InFlight` while the first request for the key is still running
    /// * Transient infra errors; the transfer is then finished by recovery
    pub async fn initiate(&self, req: TransferRequest) -> Result<TransferResult, TransferError> {
        req.check(self.config.max_amount_scale)?;

        let fingerprint = req.fingerprint();
        let transfer_ref = match self.guard.begin(&req.client_key, &fingerprint).await? {
            GuardDecision::Fresh(transfer_ref) => transfer_ref,
            GuardDecision::InFlight(transfer_ref) => {
                debug!(transfer_ref = %transfer_ref, "Duplicate request while in flight");
                return Err(TransferError::InFlight(transfer_ref));
            }
            GuardDecision::Cached(result) => return Ok(result),
            GuardDecision::Stale(stale) => {
                if self.store.load(stale).await?.is_some() {
                    return self.adopt(&req.client_key, stale).await;
                }
                match self.guard.reclaim(&req.client_key, stale, &fingerprint).await? {
                    Some(transfer_ref) => {
                        info!(stale = %stale, transfer_ref = %transfer_ref, "Reclaimed key of a transfer that was never persisted");
                        transfer_ref
                    }
                    None => return Err(TransferError::InFlight(stale)),
                }
            }
        };

        let transfer = TransferAggregate::new(transfer_ref, &req);
        match tokio::time::timeout(self.config.store_timeout(), self.store.save(&transfer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Nothing was written: the key may be used again
                if let Err(release_err) = self.guard.release(&req.client_key).await {
                    warn!(transfer_ref = %transfer_ref, error = %release_err, "Failed to release idempotency key");
                }
                return Err(e.into());
            }
            Err(_) => {
                warn!(transfer_ref = %transfer_ref, "Initial save timed out, keeping idempotency key");
                return Err(TransferError::StoreUnavailable(
                    "initial save timed out".to_string(),
                ));
            }
        }

        info!(
            transfer_ref = %transfer_ref,
            source = %transfer.source,
            destination = %transfer.destination,
            amount = %transfer.amount,
            currency = %transfer.currency,
            "Transfer initiated"
        );
        self.publish(TransferEventKind::TransferInitiated, &transfer)
            .await;

        let settled = self.drive(transfer).await?;
        Ok(self.settle_key(&settled).await)
    }

    /// Drive an existing transfer to a terminal state (crash recovery)
    pub async fn resume(&self, transfer_ref: TransferRef) -> Result<TransferResult, TransferError> {
        let transfer = self.load(transfer_ref).await?;
        let settled = if transfer.status.is_terminal() {
            transfer
        } else {
            info!(
                transfer_ref = %transfer_ref,
                status = %transfer.status,
                version = transfer.version,
                "Resuming transfer"
            );
            self.drive(transfer).await?
        };
        Ok(self.settle_key(&settled).await)
    }

    /// Take over the transfer behind an expired in-flight marker
    ///
    /// The key stays bound to the original transfer; its worker is presumed
    /// gone, and running it again is safe because every step checks the
    /// ledger and every save is a CAS.
    async fn adopt(
        &self,
        key: &str,
        transfer_ref: TransferRef,
    ) -> Result<TransferResult, TransferError> {
        if !self.guard.adopt(key, transfer_ref).await? {
            return Err(TransferError::InFlight(transfer_ref));
        }
        warn!(transfer_ref = %transfer_ref, "Adopting transfer whose in-flight marker expired");
        self.resume(transfer_ref).await
    }

    /// Rebuild client-key records from persisted transfers
    ///
    /// Run once at startup, before accepting requests and before the recovery
    /// sweep, when the idempotency store does not outlive the process.
    pub async fn restore_idempotency(&self) -> Result<usize, TransferError> {
        let mut restored = 0;
        for t in self.store.find_latest().await? {
            if self.guard.restore(&t).await? {
                restored += 1;
            }
        }
        info!(count = restored, "Idempotency records restored from store");
        Ok(restored)
    }

    pub async fn get_status(
        &self,
        transfer_ref: TransferRef,
    ) -> Result<TransferStatusView, TransferError> {
        Ok(self.load(transfer_ref).await?.status_view())
    }

    /// Cancel a transfer
    ///
    /// Before validation completes the transfer ends in VALIDATION_FAILED
    /// right away. Later, the request is recorded and the worker driving the
    /// transfer compensates instead of starting its next effectful step.
    pub async fn cancel(
        &self,
        transfer_ref: TransferRef,
    ) -> Result<TransferStatusView, TransferError> {
        let current = self.load(transfer_ref).await?;
        if current.status.is_terminal() {
            return Err(TransferError::AlreadyTerminal(current.status));
        }

        if current.status.is_cancellable() {
            match self.commit(current.reject(CANCELLED_REASON)?).await {
                Ok(cancelled) => {
                    info!(transfer_ref = %transfer_ref, "Transfer cancelled before validation");
                    self.settle_key(&cancelled).await;
                    return Ok(cancelled.status_view());
                }
                Err(TransferError::VersionConflict { .. }) => {
                    debug!(transfer_ref = %transfer_ref, "Transfer moved on, recording cancellation request");
                }
                Err(e) => return Err(e),
            }
        }

        self.cancellations.insert(transfer_ref);
        info!(transfer_ref = %transfer_ref, "Cancellation requested");

        let latest = self.load(transfer_ref).await?;
        if latest.status.is_terminal() {
            self.cancellations.remove(&transfer_ref);
        }
        Ok(latest.status_view())
    }

    // ========================================================================
    // State machine
    // ========================================================================

    async fn drive(
        &self,
        mut transfer: TransferAggregate,
    ) -> Result<TransferAggregate, TransferError> {
        while !transfer.status.is_terminal() {
            transfer = match self.advance(&transfer).await {
                Ok(next) => next,
                Err(TransferError::VersionConflict {
                    transfer_ref,
                    expected,
                    found,
                }) => {
                    // Another worker already transitioned - get current state
                    let current = self.load(transfer_ref).await?;
                    if current.status.is_terminal() {
                        debug!(
                            transfer_ref = %transfer_ref,
                            status = %current.status,
                            "Transfer settled by another worker"
                        );
                        return Ok(current);
                    }
                    warn!(
                        transfer_ref = %transfer_ref,
                        expected = expected,
                        found = found,
                        "Lost transition race"
                    );
                    return Err(TransferError::VersionConflict {
                        transfer_ref,
                        expected,
                        found,
                    });
                }
                Err(e) => return Err(e),
            };
        }
        Ok(transfer)
    }

    /// Execute one transition and persist it
    async fn advance(&self, t: &TransferAggregate) -> Result<TransferAggregate, TransferError> {
        let cancelled = self.cancellations.contains(&t.transfer_ref);

        let next = match t.status {
            TransferStatus::Pending | TransferStatus::Validating if cancelled => {
                t.reject(CANCELLED_REASON)?
            }
            TransferStatus::Pending => t.transition(TransferStatus::Validating)?,
            TransferStatus::Validating => self.validate(t).await?,
            TransferStatus::Validated | TransferStatus::DebitCompleted if cancelled => {
                info!(transfer_ref = %t.transfer_ref, status = %t.status, "Honoring cancellation");
                t.begin_compensation(None, CANCELLED_REASON)?
            }
            TransferStatus::Validated => t.transition(TransferStatus::DebitPending)?,
            TransferStatus::DebitPending => {
                self.run_effect(&self.debit, t, TransferStatus::DebitCompleted)
                    .await?
            }
            TransferStatus::DebitCompleted => t.transition(TransferStatus::CreditPending)?,
            TransferStatus::CreditPending => {
                self.run_effect(&self.credit, t, TransferStatus::CreditCompleted)
                    .await?
            }
            TransferStatus::CreditCompleted => t.transition(TransferStatus::Completed)?,
            TransferStatus::Compensating => return self.compensate(t.clone()).await,
            _ => return Ok(t.clone()),
        };

        self.commit(next).await
    }

    async fn validate(&self, t: &TransferAggregate) -> Result<TransferAggregate, TransferError> {
        match self.validation.execute(t).await {
            StepOutcome::Ok(_) => t.transition(TransferStatus::Validated),
            StepOutcome::Fail(StepFailure::Rejected(reason)) => {
                info!(transfer_ref = %t.transfer_ref, reason = %reason, "Validation failed");
                t.reject(reason)
            }
            StepOutcome::Fail(StepFailure::Infra(e) | StepFailure::Execution(e)) => {
                warn!(
                    transfer_ref = %t.transfer_ref,
                    error = %e,
                    "Validation could not run, leaving transfer for retry"
                );
                Err(e.into())
            }
        }
    }

    /// Run an effectful step from its pending state
    async fn run_effect(
        &self,
        step: &dyn SagaStep,
        t: &TransferAggregate,
        done: TransferStatus,
    ) -> Result<TransferAggregate, TransferError> {
        let name = step.name();

        let applied = step.already_applied(t).await.map_err(|e| {
            warn!(transfer_ref = %t.transfer_ref, step = %name, error = %e, "Cannot check ledger for an applied step");
            TransferError::from(e)
        })?;
        if let Some(tx_id) = applied {
            info!(
                transfer_ref = %t.transfer_ref,
                step = %name,
                tx_id = %tx_id,
                "Step already applied, skipping ledger call"
            );
            return Ok(t.transition(done)?.with_step_tx(name, tx_id));
        }

        match step.execute(t).await {
            StepOutcome::Ok(Some(tx_id)) => Ok(t.transition(done)?.with_step_tx(name, tx_id)),
            StepOutcome::Ok(None) => t.transition(done),
            StepOutcome::Fail(failure) => {
                let reason = failure.reason(name);
                warn!(
                    transfer_ref = %t.transfer_ref,
                    step = %name,
                    reason = %reason,
                    "Step failed, compensating"
                );
                t.begin_compensation(Some(name), reason)
            }
        }
    }

    fn effect(&self, name: StepName) -> Option<&dyn SagaStep> {
        match name {
            StepName::Debit => Some(&self.debit),
            StepName::Credit => Some(&self.credit),
            StepName::Validation => None,
        }
    }

    /// Undo executed steps newest first
    ///
    /// The step that was in progress when the failure hit is included: its
    /// effect may have landed even though the call reported an error.
    async fn compensate(
        &self,
        mut t: TransferAggregate,
    ) -> Result<TransferAggregate, TransferError> {
        for name in [StepName::Credit, StepName::Debit] {
            let Some(step) = self.effect(name) else {
                continue;
            };
            let (executed, compensated) = t
                .step(name)
                .map(|r| (r.is_executed(), r.is_compensated()))
                .unwrap_or_default();
            if compensated || !(executed || t.failed_step == Some(name)) {
                continue;
            }

            match self.compensate_with_retry(step, &t).await {
                CompensationOutcome::Compensated(tx_id) => {
                    t = self
                        .commit(t.revise()?.with_compensation_tx(name, tx_id))
                        .await?;
                }
                CompensationOutcome::NothingToCompensate => {
                    debug!(transfer_ref = %t.transfer_ref, step = %name, "Nothing to compensate");
                }
                CompensationOutcome::Failed(err) => {
                    error!(
                        transfer_ref = %t.transfer_ref,
                        step = %name,
                        error = %err,
                        "Compensation failed, manual reconciliation required"
                    );
                    let failed = t.fail_for_reconciliation()?.with_compensation_error(name, err);
                    return self.commit(failed).await;
                }
            }
        }

        self.commit(t.transition(TransferStatus::Compensated)?).await
    }

    async fn compensate_with_retry(
        &self,
        step: &dyn SagaStep,
        t: &TransferAggregate,
    ) -> CompensationOutcome {
        let attempts = self.config.compensation_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match step.compensate(t).await {
                CompensationOutcome::Failed(err) => {
                    warn!(
                        transfer_ref = %t.transfer_ref,
                        step = %step.name(),
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Compensation attempt failed"
                    );
                    last_error = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.compensation_retry_delay()).await;
                    }
                }
                outcome => {
                    info!(
                        transfer_ref = %t.transfer_ref,
                        step = %step.name(),
                        attempt = attempt,
                        outcome = ?outcome,
                        "Compensation attempt succeeded"
                    );
                    return outcome;
                }
            }
        }
        CompensationOutcome::Failed(last_error)
    }

    // ========================================================================
    // Persistence and side channels
    // ========================================================================

    /// Save `next`; the caller that wins the save owns the terminal side effects
    async fn commit(&self, next: TransferAggregate) -> Result<TransferAggregate, TransferError> {
        self.persist(&next).await?;
        debug!(
            transfer_ref = %next.transfer_ref,
            status = %next.status,
            version = next.version,
            "Transition persisted"
        );
        if next.status.is_terminal() {
            self.on_terminal(&next).await;
        }
        Ok(next)
    }

    async fn persist(&self, snapshot: &TransferAggregate) -> Result<(), TransferError> {
        match tokio::time::timeout(self.config.store_timeout(), self.store.save(snapshot)).await {
            Ok(result) => result.map_err(|e| {
                if !matches!(e, StoreError::VersionConflict { .. }) {
                    error!(
                        transfer_ref = %snapshot.transfer_ref,
                        version = snapshot.version,
                        error = %e,
                        "Failed to persist transfer"
                    );
                }
                TransferError::from(e)
            }),
            Err(_) => {
                error!(
                    transfer_ref = %snapshot.transfer_ref,
                    version = snapshot.version,
                    "Persist timed out"
                );
                Err(TransferError::StoreUnavailable(format!(
                    "save of {} v{} timed out",
                    snapshot.transfer_ref, snapshot.version
                )))
            }
        }
    }

    async fn load(&self, transfer_ref: TransferRef) -> Result<TransferAggregate, TransferError> {
        self.store
            .load(transfer_ref)
            .await?
            .ok_or(TransferError::TransferNotFound(transfer_ref))
    }

    async fn on_terminal(&self, t: &TransferAggregate) {
        self.cancellations.remove(&t.transfer_ref);
        info!(
            transfer_ref = %t.transfer_ref,
            status = %t.status,
            reason = ?t.failure_reason,
            "Transfer settled"
        );

        let kind = match t.status {
            TransferStatus::Completed => TransferEventKind::TransferCompleted,
            TransferStatus::Compensated => TransferEventKind::TransferCompensated,
            TransferStatus::ValidationFailed | TransferStatus::Failed => {
                TransferEventKind::TransferFailed
            }
            _ => return,
        };
        self.publish(kind, t).await;
        if t.reconciliation_required {
            self.publish(TransferEventKind::ReconciliationRequired, t)
                .await;
        }
    }

    async fn publish(&self, kind: TransferEventKind, t: &TransferAggregate) {
        let event = TransferEvent::from_aggregate(&self.config.events_topic, kind, t);
        if let Err(e) = self.publisher.publish(event).await {
            warn!(transfer_ref = %t.transfer_ref, kind = ?kind, error = %e, "Event publish failed");
        }
    }

    /// Record the terminal result under the client key
    async fn settle_key(&self, t: &TransferAggregate) -> TransferResult {
        let result = t.result();
        if let Err(e) = self.guard.complete(&t.client_key, &result).await {
            error!(
                transfer_ref = %t.transfer_ref,
                error = %e,
                "Failed to record result for idempotency key"
            );
        }
        result
    }
}
