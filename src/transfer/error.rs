//! Transfer Error Types
//!
//! `TransferError` is what callers of the orchestrator see. Component errors
//! (ledger, store, idempotency store, event bus) have their own enums and
//! convert into it.

use thiserror::Error;

use super::state::TransferStatus;
use super::types::{AccountId, TransferRef};

/// Error taxonomy used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-retryable, no side effect, no compensation
    Validation,
    /// Lock timeout, store unavailable - retryable
    TransientInfra,
    /// External call failed after partial effect - handled by compensation
    Execution,
    /// Compensation failed - manual reconciliation
    Compensation,
}

/// Transfer error types returned by the orchestrator
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Idempotency Errors ===
    #[error("Idempotency key reused with different parameters")]
    IdempotencyKeyReused,

    #[error("Transfer {0} for this idempotency key is still in flight, retry later")]
    InFlight(TransferRef),

    #[error("Idempotency store unavailable: {0}")]
    IdempotencyUnavailable(String),

    // === Infrastructure Errors ===
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Lock timeout on account {0}")]
    LockTimeout(AccountId),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Version conflict on transfer {transfer_ref}: expected v{expected}, found v{found}")]
    VersionConflict {
        transfer_ref: TransferRef,
        expected: u64,
        found: u64,
    },

    // === Lifecycle Errors ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferRef),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Transfer already terminal: {0}")]
    AlreadyTerminal(TransferStatus),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::InvalidRequest(_) => "INVALID_REQUEST",
            TransferError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            TransferError::InFlight(_) => "IN_FLIGHT",
            TransferError::IdempotencyUnavailable(_) => "IDEMPOTENCY_UNAVAILABLE",
            TransferError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            TransferError::LockTimeout(_) => "LOCK_TIMEOUT",
            TransferError::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            TransferError::VersionConflict { .. } => "VERSION_CONFLICT",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            TransferError::AlreadyTerminal(_) => "ALREADY_TERMINAL",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SameAccount
            | TransferError::InvalidAmount
            | TransferError::InvalidRequest(_)
            | TransferError::IdempotencyKeyReused
            | TransferError::TransferNotFound(_)
            | TransferError::AlreadyTerminal(_) => ErrorKind::Validation,
            TransferError::InFlight(_)
            | TransferError::IdempotencyUnavailable(_)
            | TransferError::StoreUnavailable(_)
            | TransferError::LockTimeout(_)
            | TransferError::LedgerUnavailable(_)
            | TransferError::VersionConflict { .. } => ErrorKind::TransientInfra,
            TransferError::InvalidStateTransition { .. } => ErrorKind::Execution,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }
}

// ============================================================================
// Component errors
// ============================================================================

/// Ledger client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account {0} is not active")]
    AccountInactive(AccountId),

    #[error("Insufficient balance on account {0}")]
    InsufficientFunds(AccountId),

    #[error("Lock timeout on account {0}")]
    LockTimeout(AccountId),

    #[error("Lock for account {0} was not issued by this ledger")]
    LockNotHeld(AccountId),

    #[error("Ledger call timed out")]
    Timeout,

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether the mutation may have been applied despite the error
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LedgerError::Timeout | LedgerError::Unavailable(_))
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::LockTimeout(id) => TransferError::LockTimeout(id),
            other => TransferError::LedgerUnavailable(other.to_string()),
        }
    }
}

/// State store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Version conflict on {transfer_ref}: expected v{expected}, found v{found}")]
    VersionConflict {
        transfer_ref: TransferRef,
        expected: u64,
        found: u64,
    },

    #[error("Transfer {0} is terminal and immutable")]
    Immutable(TransferRef),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Journal corrupted: {0}")]
    Corrupted(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData => StoreError::Corrupted(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Corrupted(e.to_string())
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict {
                transfer_ref,
                expected,
                found,
            } => TransferError::VersionConflict {
                transfer_ref,
                expected,
                found,
            },
            StoreError::Immutable(r) => {
                TransferError::StoreUnavailable(format!("transfer {r} is terminal and immutable"))
            }
            StoreError::Unavailable(msg) | StoreError::Corrupted(msg) => {
                TransferError::StoreUnavailable(msg)
            }
        }
    }
}

/// Idempotency store errors
#[derive(Error, Debug, Clone)]
pub enum IdempotencyError {
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),

    /// The key is bound to a different transfer than the one writing to it
    #[error("Idempotency key {key} belongs to transfer {owner}, not {writer}")]
    NotOwner {
        key: String,
        owner: TransferRef,
        writer: TransferRef,
    },
}

impl From<IdempotencyError> for TransferError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::Unavailable(msg) => TransferError::IdempotencyUnavailable(msg),
            IdempotencyError::NotOwner { .. } => TransferError::IdempotencyKeyReused,
        }
    }
}

/// Event bus errors (never fail a transfer)
#[derive(Error, Debug, Clone)]
pub enum EventError {
    #[error("Event publish failed: {0}")]
    Publish(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::SameAccount.code(), "SAME_ACCOUNT");
        assert_eq!(
            TransferError::InFlight(TransferRef::new()).code(),
            "IN_FLIGHT"
        );
        assert_eq!(
            TransferError::IdempotencyUnavailable("down".into()).code(),
            "IDEMPOTENCY_UNAVAILABLE"
        );
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(TransferError::InvalidAmount.kind(), ErrorKind::Validation);
        assert!(!TransferError::IdempotencyKeyReused.is_retryable());
        assert!(TransferError::LockTimeout(AccountId::from("a")).is_retryable());
        assert!(TransferError::StoreUnavailable("io".into()).is_retryable());
        assert_eq!(
            TransferError::InvalidStateTransition {
                from: TransferStatus::Completed,
                to: TransferStatus::Pending,
            }
            .kind(),
            ErrorKind::Execution
        );
    }

    #[test]
    fn test_component_conversions() {
        let e: TransferError = LedgerError::LockTimeout(AccountId::from("a")).into();
        assert!(matches!(e, TransferError::LockTimeout(_)));

        let e: TransferError = IdempotencyError::Unavailable("redis down".into()).into();
        assert!(matches!(e, TransferError::IdempotencyUnavailable(_)));

        let e: TransferError = IdempotencyError::NotOwner {
            key: "k1".into(),
            owner: TransferRef::new(),
            writer: TransferRef::new(),
        }
        .into();
        assert!(matches!(e, TransferError::IdempotencyKeyReused));

        let r = TransferRef::new();
        let e: TransferError = StoreError::VersionConflict {
            transfer_ref: r,
            expected: 3,
            found: 4,
        }
        .into();
        assert!(matches!(e, TransferError::VersionConflict { expected: 3, found: 4, .. }));
    }

    #[test]
    fn test_ambiguous_ledger_errors() {
        assert!(LedgerError::Timeout.is_ambiguous());
        assert!(!LedgerError::InsufficientFunds(AccountId::from("a")).is_ambiguous());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TransferError::InvalidAmount.to_string(),
            "Amount must be greater than zero"
        );
    }
}
