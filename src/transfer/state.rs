//! Transfer SAGA Status Definitions
//!
//! Status IDs are stable and used by the journal encoding and logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer SAGA status
///
/// Terminal states: COMPLETED (80), VALIDATION_FAILED (-10),
/// COMPENSATED (-30), FAILED (-40)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TransferStatus {
    /// Initial state - request accepted and recorded
    Pending = 0,

    /// Validation checks running (no side effects yet)
    Validating = 10,

    /// Validation passed
    Validated = 20,

    /// Source debit initiated (persist-before-call)
    DebitPending = 30,

    /// Source debit confirmed - funds are IN-FLIGHT
    DebitCompleted = 40,

    /// Destination credit initiated (persist-before-call)
    CreditPending = 50,

    /// Destination credit confirmed
    CreditCompleted = 60,

    /// Terminal: transfer completed successfully
    Completed = 80,

    /// Terminal: validation rejected the request (no funds moved)
    ValidationFailed = -10,

    /// Compensation in progress (reverting executed steps)
    Compensating = -20,

    /// Terminal: every executed step was reverted
    Compensated = -30,

    /// Terminal: compensation could not complete
    Failed = -40,
}

impl TransferStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::ValidationFailed
                | TransferStatus::Compensated
                | TransferStatus::Failed
        )
    }

    /// Check if funds may be in-flight (source debit possibly applied,
    /// saga not yet resolved)
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransferStatus::DebitPending
                | TransferStatus::DebitCompleted
                | TransferStatus::CreditPending
                | TransferStatus::CreditCompleted
                | TransferStatus::Compensating
        )
    }

    /// Whether a client cancellation can still end the transfer without
    /// compensation.
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Validating)
    }

    /// Allowed edges of the state machine.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Pending, ValidationFailed)
                | (Validating, Validated)
                | (Validating, ValidationFailed)
                | (Validated, DebitPending)
                | (Validated, Compensating)
                | (DebitPending, DebitCompleted)
                | (DebitPending, Compensating)
                | (DebitCompleted, CreditPending)
                | (DebitCompleted, Compensating)
                | (CreditPending, CreditCompleted)
                | (CreditPending, Compensating)
                | (CreditCompleted, Completed)
                | (CreditCompleted, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Get the numeric status ID
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a numeric status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::Validating),
            20 => Some(TransferStatus::Validated),
            30 => Some(TransferStatus::DebitPending),
            40 => Some(TransferStatus::DebitCompleted),
            50 => Some(TransferStatus::CreditPending),
            60 => Some(TransferStatus::CreditCompleted),
            80 => Some(TransferStatus::Completed),
            -10 => Some(TransferStatus::ValidationFailed),
            -20 => Some(TransferStatus::Compensating),
            -30 => Some(TransferStatus::Compensated),
            -40 => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Validating => "VALIDATING",
            TransferStatus::Validated => "VALIDATED",
            TransferStatus::DebitPending => "DEBIT_PENDING",
            TransferStatus::DebitCompleted => "DEBIT_COMPLETED",
            TransferStatus::CreditPending => "CREDIT_PENDING",
            TransferStatus::CreditCompleted => "CREDIT_COMPLETED",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::ValidationFailed => "VALIDATION_FAILED",
            TransferStatus::Compensating => "COMPENSATING",
            TransferStatus::Compensated => "COMPENSATED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}
