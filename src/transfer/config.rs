use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::money::DEFAULT_MAX_SCALE;

/// Orchestrator configuration, injected at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Bounded wait for a per-account lock
    pub lock_timeout_ms: u64,
    /// Bound on a single ledger mutation call
    pub ledger_call_timeout_ms: u64,
    /// Bound on the durable write barrier after each transition
    pub store_timeout_ms: u64,
    /// TTL of a completed idempotency record
    pub idempotency_ttl_secs: u64,
    /// TTL of an in-flight idempotency marker
    pub in_flight_ttl_secs: u64,
    /// Flat fee the source must be able to cover on top of the amount
    pub transfer_fee: Decimal,
    /// Optional per-transfer limit
    pub max_transfer_amount: Option<Decimal>,
    /// Maximum fractional digits accepted for an amount
    pub max_amount_scale: u32,
    /// Topic name stamped on published lifecycle events
    pub events_topic: String,
    /// Attempts per compensation before declaring it failed
    pub compensation_attempts: u32,
    pub compensation_retry_delay_ms: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            ledger_call_timeout_ms: 5_000,
            store_timeout_ms: 2_000,
            idempotency_ttl_secs: 24 * 60 * 60,
            in_flight_ttl_secs: 5 * 60,
            transfer_fee: Decimal::ZERO,
            max_transfer_amount: None,
            max_amount_scale: DEFAULT_MAX_SCALE,
            events_topic: "transfers.lifecycle".to_string(),
            compensation_attempts: 3,
            compensation_retry_delay_ms: 100,
        }
    }
}

impl SagaConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn ledger_call_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_call_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_secs(self.in_flight_ttl_secs)
    }

    pub fn compensation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.compensation_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_config_default() {
        let config = SagaConfig::default();
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.lock_timeout(), Duration::from_secs(2));
        assert_eq!(config.compensation_attempts, 3);
        assert!(config.max_transfer_amount.is_none());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SagaConfig =
            serde_yaml::from_str("lock_timeout_ms: 50\ntransfer_fee: \"1.25\"\n").unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(50));
        assert_eq!(config.transfer_fee, Decimal::new(125, 2));
        assert_eq!(config.events_topic, "transfers.lifecycle");
    }
}
