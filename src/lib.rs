//! Transfer SAGA - money transfers between ledger accounts
//!
//! # Modules
//!
//! - [`money`] - Decimal amounts and currency codes
//! - [`transfer`] - SAGA orchestrator, steps, idempotency, persistence
//! - [`config`] - YAML application config
//! - [`logging`] - `tracing` subscriber setup

pub mod config;
pub mod logging;
pub mod money;
pub mod transfer;

// Convenient re-exports at crate root
pub use money::Currency;
pub use transfer::{
    TransferError, TransferOrchestrator, TransferRef, TransferRequest, TransferResult,
    TransferStatus,
};
