//! Money-transfer SAGA
//!
//! Moves funds between two ledger accounts as a sequence of local steps
//! (validate, debit, credit), each with an inverse. Every transition of the
//! transfer aggregate is persisted before the next step runs, so a crashed
//! worker can be resumed from the last durable state.
//!
//! # State Machine
//!
//! ```text
//! PENDING → VALIDATING → VALIDATED → DEBIT_PENDING → DEBIT_COMPLETED
//!               ↓                                          ↓
//!       VALIDATION_FAILED       CREDIT_PENDING ←───────────┘
//!                                     ↓
//!                              CREDIT_COMPLETED → COMPLETED
//!
//! VALIDATED ..= CREDIT_COMPLETED → COMPENSATING → COMPENSATED
//!                                       ↓
//!                                    FAILED (reconciliation_required)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the aggregate is saved before each ledger call
//! 2. **Tagged Mutations**: ledger mutations are idempotent by
//!    `(account, transfer_ref)`; reversals by `(account, transfer_ref-COMP)`
//! 3. **Global Lock Order**: two-account locks are taken lexicographically
//! 4. **Never Lose Money Silently**: a failed compensation ends in FAILED with
//!    `reconciliation_required` and an out-of-band alert

pub mod config;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod journal;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod state;
pub mod steps;
pub mod store;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use config::SagaConfig;
pub use error::{ErrorKind, LedgerError, StoreError, TransferError};
pub use events::{
    BroadcastEventPublisher, EventPublisher, TracingEventPublisher, TransferEvent,
    TransferEventKind,
};
pub use idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
pub use journal::JournalStateStore;
pub use ledger::{AccountSnapshot, AccountStatus, InMemoryLedger, LedgerClient};
pub use orchestrator::{CANCELLED_REASON, TransferOrchestrator};
pub use state::TransferStatus;
pub use store::{InMemoryStateStore, StateStore};
pub use types::{
    AccountId, LedgerTxId, MutationTag, StepName, TransferAggregate, TransferRef,
    TransferRequest, TransferResult, TransferStatusView,
};
pub use worker::{RecoveryWorker, WorkerConfig};
