//! Transfer Core Types
//!
//! Identifiers, the request, and the immutable transfer aggregate snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{ErrorKind, TransferError};
use super::state::TransferStatus;
use crate::money::{Currency, MoneyError, validate_amount};

/// Transfer reference - ULID-based, externally visible
///
/// Using ULID provides:
/// - Monotonic, sortable IDs
/// - No coordination needed (no machine_id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferRef(ulid::Ulid);

impl TransferRef {
    /// Generate a new unique TransferRef
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferRef {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Account identifier owned by the ledger
///
/// Ordering is lexicographic and defines the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ledger transaction id returned by a balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerTxId(pub String);

impl fmt::Display for LedgerTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Effectful SAGA steps (validation has no effect to record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    Validation,
    Debit,
    Credit,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Validation => "VALIDATION",
            StepName::Debit => "DEBIT",
            StepName::Credit => "CREDIT",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency tag attached to ledger mutations.
///
/// Forward mutations are tagged with the bare transfer reference, reversals
/// with `{transfer_ref}-COMP`. The ledger deduplicates by `(account, tag)`, so
/// a replayed step or compensation cannot apply twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationTag(String);

impl MutationTag {
    pub fn forward(transfer_ref: TransferRef) -> Self {
        Self(transfer_ref.to_string())
    }

    pub fn compensation(transfer_ref: TransferRef) -> Self {
        Self(format!("{transfer_ref}-COMP"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transfer request from the API layer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Client-provided idempotency key
    pub client_key: String,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
}

impl TransferRequest {
    pub fn new(
        client_key: impl Into<String>,
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            client_key: client_key.into(),
            source,
            destination,
            amount,
            currency,
        }
    }

    /// Structural checks that must hold before an aggregate can exist
    pub fn check(&self, max_scale: u32) -> Result<(), TransferError> {
        if self.client_key.trim().is_empty() {
            return Err(TransferError::InvalidRequest(
                "idempotency key must not be empty".into(),
            ));
        }
        if self.source == self.destination {
            return Err(TransferError::SameAccount);
        }
        validate_amount(self.amount, max_scale).map_err(|e| match e {
            MoneyError::InvalidAmount => TransferError::InvalidAmount,
            other => TransferError::InvalidRequest(other.to_string()),
        })
    }

    /// Parameters a reused idempotency key must match
    pub fn fingerprint(&self) -> RequestFingerprint {
        RequestFingerprint::new(&self.source, &self.destination, self.amount, &self.currency)
    }
}

/// Parameters bound to an idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
}

impl RequestFingerprint {
    fn new(
        source: &AccountId,
        destination: &AccountId,
        amount: Decimal,
        currency: &Currency,
    ) -> Self {
        Self {
            source: source.clone(),
            destination: destination.clone(),
            amount: amount.normalize(),
            currency: currency.clone(),
        }
    }
}

/// Per-step effect markers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Ledger tx of the forward mutation, once known
    pub tx_id: Option<LedgerTxId>,
    /// Ledger tx of the reversal, once compensated
    pub compensation_tx_id: Option<LedgerTxId>,
    /// Last compensation failure (manual reconciliation input)
    pub compensation_error: Option<String>,
}

impl StepRecord {
    pub fn is_executed(&self) -> bool {
        self.tx_id.is_some()
    }

    pub fn is_compensated(&self) -> bool {
        self.compensation_tx_id.is_some()
    }
}

/// Terminal (or current) outcome returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_ref: TransferRef,
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
}

/// Read-model for `get_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatusView {
    pub status: TransferStatus,
    pub failure_reason: Option<String>,
    pub reconciliation_required: bool,
    /// Error class behind a failed outcome
    pub failure_kind: Option<ErrorKind>,
}

/// Transfer aggregate snapshot
///
/// Snapshots are immutable: every transition returns a new value with
/// `version + 1`. The store keeps all versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAggregate {
    pub transfer_ref: TransferRef,
    pub client_key: String,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    /// Step that failed and triggered compensation
    pub failed_step: Option<StepName>,
    pub debit: StepRecord,
    pub credit: StepRecord,
    /// Set when compensation could not finish; cleared only by operators
    pub reconciliation_required: bool,
    pub version: u64,
}

impl TransferAggregate {
    /// Create a new aggregate in PENDING state (version 0)
    pub fn new(transfer_ref: TransferRef, req: &TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            transfer_ref,
            client_key: req.client_key.clone(),
            source: req.source.clone(),
            destination: req.destination.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
            status: TransferStatus::Pending,
            created_at: now,
            updated_at: now,
            failure_reason: None,
            failed_step: None,
            debit: StepRecord::default(),
            credit: StepRecord::default(),
            reconciliation_required: false,
            version: 0,
        }
    }

    /// Produce the next snapshot in `next` status
    pub fn transition(&self, next: TransferStatus) -> Result<Self, TransferError> {
        if !self.status.can_transition_to(next) {
            return Err(TransferError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        let mut snapshot = self.clone();
        snapshot.status = next;
        snapshot.version += 1;
        snapshot.updated_at = Utc::now();
        Ok(snapshot)
    }

    /// VALIDATION_FAILED with a caller-safe reason
    pub fn reject(&self, reason: impl Into<String>) -> Result<Self, TransferError> {
        let mut snapshot = self.transition(TransferStatus::ValidationFailed)?;
        snapshot.failure_reason = Some(reason.into());
        Ok(snapshot)
    }

    /// Enter COMPENSATING because `step` failed
    pub fn begin_compensation(
        &self,
        step: Option<StepName>,
        reason: impl Into<String>,
    ) -> Result<Self, TransferError> {
        let mut snapshot = self.transition(TransferStatus::Compensating)?;
        snapshot.failed_step = step;
        snapshot.failure_reason = Some(reason.into());
        Ok(snapshot)
    }

    /// Terminal FAILED: compensation could not finish
    pub fn fail_for_reconciliation(&self) -> Result<Self, TransferError> {
        let mut snapshot = self.transition(TransferStatus::Failed)?;
        snapshot.reconciliation_required = true;
        Ok(snapshot)
    }

    pub fn step(&self, step: StepName) -> Option<&StepRecord> {
        match step {
            StepName::Debit => Some(&self.debit),
            StepName::Credit => Some(&self.credit),
            StepName::Validation => None,
        }
    }

    fn step_mut(&mut self, step: StepName) -> Option<&mut StepRecord> {
        match step {
            StepName::Debit => Some(&mut self.debit),
            StepName::Credit => Some(&mut self.credit),
            StepName::Validation => None,
        }
    }

    /// Attach the forward ledger tx of `step` (same status, no version bump;
    /// combine with `transition` or `revise`)
    pub fn with_step_tx(mut self, step: StepName, tx: LedgerTxId) -> Self {
        if let Some(record) = self.step_mut(step) {
            record.tx_id = Some(tx);
        }
        self
    }

    /// New version in the same (non-terminal) status, used for marker-only
    /// updates while COMPENSATING
    pub fn revise(&self) -> Result<Self, TransferError> {
        if self.status.is_terminal() {
            return Err(TransferError::InvalidStateTransition {
                from: self.status,
                to: self.status,
            });
        }
        let mut snapshot = self.clone();
        snapshot.version += 1;
        snapshot.updated_at = Utc::now();
        Ok(snapshot)
    }

    pub fn with_compensation_tx(mut self, step: StepName, tx: LedgerTxId) -> Self {
        if let Some(record) = self.step_mut(step) {
            record.compensation_tx_id = Some(tx);
            record.compensation_error = None;
        }
        self
    }

    pub fn with_compensation_error(mut self, step: StepName, error: impl Into<String>) -> Self {
        if let Some(record) = self.step_mut(step) {
            record.compensation_error = Some(error.into());
        }
        self
    }

    pub fn result(&self) -> TransferResult {
        TransferResult {
            transfer_ref: self.transfer_ref,
            status: self.status,
            failure_reason: self.failure_reason.clone(),
        }
    }

    /// Parameters the client key of this transfer was bound to
    pub fn fingerprint(&self) -> RequestFingerprint {
        RequestFingerprint::new(&self.source, &self.destination, self.amount, &self.currency)
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self.status {
            _ if self.reconciliation_required => Some(ErrorKind::Compensation),
            TransferStatus::ValidationFailed => Some(ErrorKind::Validation),
            TransferStatus::Compensating | TransferStatus::Compensated => {
                Some(ErrorKind::Execution)
            }
            _ => None,
        }
    }

    pub fn status_view(&self) -> TransferStatusView {
        TransferStatusView {
            status: self.status,
            failure_reason: self.failure_reason.clone(),
            reconciliation_required: self.reconciliation_required,
            failure_kind: self.failure_kind(),
        }
    }
}

impl fmt::Display for TransferAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} {} status={} v{}",
            self.transfer_ref,
            self.source,
            self.destination,
            self.amount,
            self.currency,
            self.status,
            self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: Decimal) -> TransferRequest {
        TransferRequest::new(
            "client-1",
            AccountId::from("acc-a"),
            AccountId::from("acc-b"),
            amount,
            Currency::new("EUR").unwrap(),
        )
    }

    #[test]
    fn test_request_check() {
        assert!(request(Decimal::from(300)).check(2).is_ok());
        assert!(matches!(
            request(Decimal::ZERO).check(2),
            Err(TransferError::InvalidAmount)
        ));
        assert!(matches!(
            request(Decimal::from(-1)).check(2),
            Err(TransferError::InvalidAmount)
        ));

        let mut same = request(Decimal::from(1));
        same.destination = same.source.clone();
        assert!(matches!(same.check(2), Err(TransferError::SameAccount)));

        let mut blank = request(Decimal::from(1));
        blank.client_key = "  ".into();
        assert!(matches!(blank.check(2), Err(TransferError::InvalidRequest(_))));
    }

    #[test]
    fn test_fingerprint_ignores_trailing_zeros() {
        let a = request(Decimal::new(3000, 1));
        let b = request(Decimal::from(300));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), request(Decimal::from(301)).fingerprint());
    }

    #[test]
    fn test_mutation_tags() {
        let r = TransferRef::new();
        assert_eq!(MutationTag::forward(r).as_str(), r.to_string());
        assert_eq!(MutationTag::compensation(r).as_str(), format!("{r}-COMP"));
    }

    #[test]
    fn test_transition_produces_new_version() {
        let agg = TransferAggregate::new(TransferRef::new(), &request(Decimal::from(5)));
        assert_eq!(agg.status, TransferStatus::Pending);
        assert_eq!(agg.version, 0);

        let next = agg.transition(TransferStatus::Validating).unwrap();
        assert_eq!(next.version, 1);
        assert_eq!(next.status, TransferStatus::Validating);
        // original snapshot untouched
        assert_eq!(agg.status, TransferStatus::Pending);

        let err = agg.transition(TransferStatus::Completed).unwrap_err();
        assert!(matches!(err, TransferError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_terminal_snapshot_is_frozen() {
        let agg = TransferAggregate::new(TransferRef::new(), &request(Decimal::from(5)))
            .transition(TransferStatus::Validating)
            .unwrap()
            .reject("insufficient funds")
            .unwrap();
        assert!(agg.status.is_terminal());
        assert!(agg.revise().is_err());
        assert!(agg.transition(TransferStatus::Validated).is_err());
    }

    #[test]
    fn test_step_markers() {
        let agg = TransferAggregate::new(TransferRef::new(), &request(Decimal::from(5)))
            .with_step_tx(StepName::Debit, LedgerTxId("ltx-1".into()))
            .with_compensation_error(StepName::Debit, "ledger down")
            .with_compensation_tx(StepName::Debit, LedgerTxId("ltx-2".into()));
        assert!(agg.debit.is_executed());
        assert!(agg.debit.is_compensated());
        assert!(agg.debit.compensation_error.is_none());
        assert!(!agg.credit.is_executed());
        assert!(agg.step(StepName::Validation).is_none());
    }

    #[test]
    fn test_aggregate_keeps_request_fingerprint() {
        let req = request(Decimal::new(3000, 1));
        let agg = TransferAggregate::new(TransferRef::new(), &req);
        assert_eq!(agg.fingerprint(), req.fingerprint());
    }

    #[test]
    fn test_failure_kind_follows_outcome() {
        let validating = TransferAggregate::new(TransferRef::new(), &request(Decimal::from(5)))
            .transition(TransferStatus::Validating)
            .unwrap();
        assert_eq!(validating.failure_kind(), None);
        assert_eq!(
            validating.reject("insufficient funds").unwrap().failure_kind(),
            Some(ErrorKind::Validation)
        );

        let compensating = validating
            .transition(TransferStatus::Validated)
            .unwrap()
            .begin_compensation(None, "cancelled by client")
            .unwrap();
        assert_eq!(compensating.failure_kind(), Some(ErrorKind::Execution));

        let failed = compensating.fail_for_reconciliation().unwrap();
        let view = failed.status_view();
        assert!(view.reconciliation_required);
        assert_eq!(view.failure_kind, Some(ErrorKind::Compensation));
    }
}
