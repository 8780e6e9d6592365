//! Transfer lifecycle events
//!
//! Downstream consumers (notification, audit, risk) subscribe to these.
//! Publishing is best effort: a failed publish is logged and never changes the
//! outcome of a transfer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::error::EventError;
use super::types::{AccountId, TransferAggregate, TransferRef};
use crate::money::Currency;

/// Event type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEventKind {
    TransferInitiated,
    TransferCompleted,
    TransferFailed,
    TransferCompensated,
    /// Out-of-band alert: compensation failed, money needs manual attention
    ReconciliationRequired,
}

/// Lifecycle event envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub topic: String,
    pub kind: TransferEventKind,
    pub transfer_ref: TransferRef,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransferEvent {
    pub fn from_aggregate(topic: &str, kind: TransferEventKind, t: &TransferAggregate) -> Self {
        Self {
            topic: topic.to_string(),
            kind,
            transfer_ref: t.transfer_ref,
            source: t.source.clone(),
            destination: t.destination.clone(),
            amount: t.amount,
            currency: t.currency.clone(),
            reason: t.failure_reason.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Event bus (external collaborator)
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TransferEvent) -> Result<(), EventError>;
}

/// In-process fan-out over `tokio::sync::broadcast`
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<TransferEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: TransferEvent) -> Result<(), EventError> {
        // No subscribers is not an error for a fan-out bus
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(receivers = receivers, "Event broadcast");
                Ok(())
            }
            Err(broadcast::error::SendError(event)) => {
                debug!(transfer_ref = %event.transfer_ref, "Event dropped, no subscribers");
                Ok(())
            }
        }
    }
}

/// Writes each event as a JSON line through `tracing`
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: TransferEvent) -> Result<(), EventError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| EventError::Publish(e.to_string()))?;
        match event.kind {
            TransferEventKind::ReconciliationRequired => {
                error!(topic = %event.topic, event = %payload, "ALERT transfer event")
            }
            _ => info!(topic = %event.topic, event = %payload, "Transfer event"),
        }
        Ok(())
    }
}
