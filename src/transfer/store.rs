//! State Store
//!
//! Durable persistence of transfer aggregate snapshots. Every save is an
//! atomic CAS on the aggregate version: version 0 creates, version `n`
//! replaces version `n - 1`. Terminal snapshots are never replaced and no
//! transfer is ever deleted.

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::StoreError;
use super::types::{TransferAggregate, TransferRef};

/// Aggregate persistence (external collaborator)
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist `snapshot`; returns only after the write is durable
    ///
    /// # Errors
    /// * `VersionConflict` - the stored version is not `snapshot.version - 1`
    /// * `Immutable` - the stored snapshot is terminal
    async fn save(&self, snapshot: &TransferAggregate) -> Result<(), StoreError>;

    /// Latest snapshot of a transfer
    async fn load(&self, transfer_ref: TransferRef) -> Result<Option<TransferAggregate>, StoreError>;

    /// All transfers whose latest snapshot is non-terminal (startup sweep)
    async fn find_incomplete(&self) -> Result<Vec<TransferAggregate>, StoreError>;

    /// Terminal transfers flagged for manual reconciliation
    async fn find_reconciliation_required(&self) -> Result<Vec<TransferAggregate>, StoreError>;

    /// Latest snapshot of every transfer (idempotency rebuild after restart)
    async fn find_latest(&self) -> Result<Vec<TransferAggregate>, StoreError>;

    /// Every persisted version of a transfer, oldest first
    async fn history(&self, transfer_ref: TransferRef) -> Result<Vec<TransferAggregate>, StoreError>;
}

/// CAS rule shared by store implementations
pub(crate) fn check_successor(
    current: Option<&TransferAggregate>,
    next: &TransferAggregate,
) -> Result<(), StoreError> {
    match current {
        None if next.version == 0 => Ok(()),
        None => Err(StoreError::VersionConflict {
            transfer_ref: next.transfer_ref,
            expected: next.version.saturating_sub(1),
            found: 0,
        }),
        Some(stored) if stored.version + 1 != next.version => Err(StoreError::VersionConflict {
            transfer_ref: next.transfer_ref,
            expected: next.version.saturating_sub(1),
            found: stored.version,
        }),
        Some(stored) if stored.status.is_terminal() => {
            Err(StoreError::Immutable(stored.transfer_ref))
        }
        Some(_) => Ok(()),
    }
}

/// In-memory store keeping the full version history per transfer
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    versions: DashMap<TransferRef, Vec<TransferAggregate>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_where(&self, pred: impl Fn(&TransferAggregate) -> bool) -> Vec<TransferAggregate> {
        let mut found: Vec<TransferAggregate> = self
            .versions
            .iter()
            .filter_map(|entry| entry.value().last().filter(|t| pred(t)).cloned())
            .collect();
        found.sort_by_key(|t| t.transfer_ref);
        found
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, snapshot: &TransferAggregate) -> Result<(), StoreError> {
        let mut history = self.versions.entry(snapshot.transfer_ref).or_default();
        check_successor(history.last(), snapshot)?;
        history.push(snapshot.clone());
        Ok(())
    }

    async fn load(&self, transfer_ref: TransferRef) -> Result<Option<TransferAggregate>, StoreError> {
        Ok(self
            .versions
            .get(&transfer_ref)
            .and_then(|h| h.value().last().cloned()))
    }

    async fn find_incomplete(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|t| !t.status.is_terminal()))
    }

    async fn find_reconciliation_required(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|t| t.reconciliation_required))
    }

    async fn find_latest(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|_| true))
    }

    async fn history(&self, transfer_ref: TransferRef) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self
            .versions
            .get(&transfer_ref)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use crate::transfer::state::TransferStatus;
    use crate::transfer::types::{AccountId, TransferRequest};
    use rust_decimal::Decimal;

    fn new_aggregate() -> TransferAggregate {
        let req = TransferRequest::new(
            "k",
            AccountId::from("a"),
            AccountId::from("b"),
            Decimal::from(10),
            Currency::new("EUR").unwrap(),
        );
        TransferAggregate::new(TransferRef::new(), &req)
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let store = InMemoryStateStore::new();
        let v0 = new_aggregate();
        store.save(&v0).await.unwrap();
        let v1 = v0.transition(TransferStatus::Validating).unwrap();
        store.save(&v1).await.unwrap();

        assert_eq!(store.load(v0.transfer_ref).await.unwrap(), Some(v1.clone()));
        assert_eq!(store.history(v0.transfer_ref).await.unwrap(), vec![v0, v1]);
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = InMemoryStateStore::new();
        let v0 = new_aggregate();
        store.save(&v0).await.unwrap();
        let v1 = v0.transition(TransferStatus::Validating).unwrap();
        store.save(&v1).await.unwrap();

        // a second writer racing from v0
        let racer = v0.reject("cancelled").unwrap();
        let err = store.save(&racer).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, found: 1, .. }));

        // duplicate create
        assert!(store.save(&v0).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_is_immutable() {
        let store = InMemoryStateStore::new();
        let v0 = new_aggregate();
        store.save(&v0).await.unwrap();
        let done = v0.reject("cancelled").unwrap();
        store.save(&done).await.unwrap();

        let mut forged = done.clone();
        forged.version += 1;
        assert!(matches!(store.save(&forged).await, Err(StoreError::Immutable(_))));
    }

    #[tokio::test]
    async fn test_find_incomplete_and_reconciliation() {
        let store = InMemoryStateStore::new();

        let open = new_aggregate();
        store.save(&open).await.unwrap();

        let closed = new_aggregate();
        store.save(&closed).await.unwrap();
        store.save(&closed.reject("no").unwrap()).await.unwrap();

        let incomplete = store.find_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].transfer_ref, open.transfer_ref);
        assert!(store.find_reconciliation_required().await.unwrap().is_empty());

        let latest = store.find_latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().any(|t| t.status.is_terminal()));
    }
}
