//! Idempotency guard: deduplicates client-retried transfer requests.
//!
//! The first request for a client key installs an in-flight marker bound to a
//! fresh transfer reference and the request fingerprint. Later requests with
//! the same key either see the stored terminal result, are told to back off
//! while the original is still running, or are rejected if the parameters
//! differ. When the store cannot be reached the guard fails closed.
//!
//! An in-flight marker that outlived its TTL is never silently replaced: the
//! guard reports it as stale and the orchestrator either adopts the transfer
//! bound to it or, when that transfer was never persisted, reclaims the key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{IdempotencyError, TransferError};
use super::types::{RequestFingerprint, TransferAggregate, TransferRef, TransferResult};

/// Marker state of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyState {
    InFlight,
    Complete(TransferResult),
}

/// Stored idempotency record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub transfer_ref: TransferRef,
    pub fingerprint: RequestFingerprint,
    pub state: IdempotencyState,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn in_flight(
        key: impl Into<String>,
        transfer_ref: TransferRef,
        fingerprint: RequestFingerprint,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            transfer_ref,
            fingerprint,
            state: IdempotencyState::InFlight,
            expires_at: expiry(ttl),
        }
    }

    /// Record for a transfer that already reached a terminal state
    pub fn completed(
        key: impl Into<String>,
        fingerprint: RequestFingerprint,
        result: TransferResult,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            transfer_ref: result.transfer_ref,
            fingerprint,
            state: IdempotencyState::Complete(result),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn is_in_flight(&self) -> bool {
        self.state == IdempotencyState::InFlight
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Idempotency store (external collaborator)
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless the key is taken; returns the record holding
    /// the key, or `None` if `record` was inserted.
    ///
    /// Expired results are replaced. In-flight markers are returned even
    /// after their TTL so the caller can check the transfer bound to them.
    async fn put_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Store the terminal result for `key` with a fresh TTL
    ///
    /// Fails with `NotOwner` when the key is bound to another transfer.
    async fn complete(
        &self,
        key: &str,
        result: TransferResult,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;

    /// Extend the in-flight marker of `key` if it is still bound to
    /// `transfer_ref`; returns whether it was extended.
    async fn renew(
        &self,
        key: &str,
        transfer_ref: TransferRef,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError>;

    /// Swap the in-flight marker bound to `stale` for `record`; returns
    /// whether the swap happened.
    async fn replace(
        &self,
        stale: TransferRef,
        record: IdempotencyRecord,
    ) -> Result<bool, IdempotencyError>;

    /// Drop an in-flight marker (only when no aggregate was persisted)
    async fn release(&self, key: &str) -> Result<(), IdempotencyError>;
}

/// DashMap-backed store with lazy expiry
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn put_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let now = Utc::now();
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get();
                if current.is_expired(now) && !current.is_in_flight() {
                    existing.insert(record);
                    Ok(None)
                } else {
                    Ok(Some(current.clone()))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(None)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let now = Utc::now();
        Ok(self
            .records
            .get(key)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.value().clone()))
    }

    async fn complete(
        &self,
        key: &str,
        result: TransferResult,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        match self.records.get_mut(key) {
            Some(record) if record.transfer_ref != result.transfer_ref => {
                Err(IdempotencyError::NotOwner {
                    key: key.to_string(),
                    owner: record.transfer_ref,
                    writer: result.transfer_ref,
                })
            }
            Some(mut record) => {
                record.state = IdempotencyState::Complete(result);
                record.expires_at = expiry(ttl);
                Ok(())
            }
            None => Err(IdempotencyError::Unavailable(format!(
                "no record for key {key}"
            ))),
        }
    }

    async fn renew(
        &self,
        key: &str,
        transfer_ref: TransferRef,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        match self.records.get_mut(key) {
            Some(mut record) if record.transfer_ref == transfer_ref && record.is_in_flight() => {
                record.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace(
        &self,
        stale: TransferRef,
        record: IdempotencyRecord,
    ) -> Result<bool, IdempotencyError> {
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut existing)
                if existing.get().transfer_ref == stale && existing.get().is_in_flight() =>
            {
                existing.insert(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        if self
            .records
            .remove_if(key, |_, r| r.state == IdempotencyState::InFlight)
            .is_some()
        {
            debug!(key = %key, "Idempotency marker released");
        }
        Ok(())
    }
}

/// Outcome of [`IdempotencyGuard::begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// First sight of the key: proceed with `transfer_ref`
    Fresh(TransferRef),
    /// A concurrent request owns the key: back off
    InFlight(TransferRef),
    /// Already finished: return the stored result
    Cached(TransferResult),
    /// The in-flight marker outlived its TTL; its transfer may or may not
    /// have been persisted
    Stale(TransferRef),
}

/// Guard in front of the orchestrator
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    in_flight_ttl: Duration,
    result_ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, in_flight_ttl: Duration, result_ttl: Duration) -> Self {
        Self {
            store,
            in_flight_ttl,
            result_ttl,
        }
    }

    /// Claim `key` for a new transfer, or report what already owns it
    ///
    /// # Errors
    /// * `IdempotencyUnavailable` - store unreachable (fail closed)
    /// * `IdempotencyKeyReused` - same key, different parameters
    pub async fn begin(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<GuardDecision, TransferError> {
        let transfer_ref = TransferRef::new();
        let marker =
            IdempotencyRecord::in_flight(key, transfer_ref, fingerprint.clone(), self.in_flight_ttl);

        let existing = self.store.put_if_absent(marker).await.map_err(|e| {
            warn!(key = %key, error = %e, "Idempotency store unreachable, rejecting request");
            TransferError::from(e)
        })?;

        let Some(existing) = existing else {
            debug!(key = %key, transfer_ref = %transfer_ref, "Idempotency key claimed");
            return Ok(GuardDecision::Fresh(transfer_ref));
        };

        if &existing.fingerprint != fingerprint {
            warn!(key = %key, transfer_ref = %existing.transfer_ref, "Idempotency key reused with different parameters");
            return Err(TransferError::IdempotencyKeyReused);
        }

        match existing.state {
            IdempotencyState::Complete(result) => {
                debug!(key = %key, transfer_ref = %result.transfer_ref, status = %result.status, "Returning cached result");
                Ok(GuardDecision::Cached(result))
            }
            IdempotencyState::InFlight if existing.is_expired(Utc::now()) => {
                warn!(key = %key, transfer_ref = %existing.transfer_ref, "In-flight marker expired");
                Ok(GuardDecision::Stale(existing.transfer_ref))
            }
            IdempotencyState::InFlight => Ok(GuardDecision::InFlight(existing.transfer_ref)),
        }
    }

    /// Re-arm the stale marker of `key` for the transfer it is bound to
    pub async fn adopt(&self, key: &str, transfer_ref: TransferRef) -> Result<bool, TransferError> {
        self.store
            .renew(key, transfer_ref, self.in_flight_ttl)
            .await
            .map_err(TransferError::from)
    }

    /// Bind `key` to a new transfer; only valid when `stale` was never persisted
    ///
    /// Returns `None` if another request changed the key in the meantime.
    pub async fn reclaim(
        &self,
        key: &str,
        stale: TransferRef,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<TransferRef>, TransferError> {
        let transfer_ref = TransferRef::new();
        let marker =
            IdempotencyRecord::in_flight(key, transfer_ref, fingerprint.clone(), self.in_flight_ttl);
        let swapped = self.store.replace(stale, marker).await?;
        Ok(swapped.then_some(transfer_ref))
    }

    /// Recreate the record of a persisted transfer (startup after restart)
    ///
    /// Terminal transfers get their result back until `updated_at` plus the
    /// result TTL; unfinished ones get a fresh in-flight marker. Live records
    /// are left alone. Returns whether a record was written.
    pub async fn restore(&self, t: &TransferAggregate) -> Result<bool, TransferError> {
        let record = if t.status.is_terminal() {
            let ttl = chrono::Duration::from_std(self.result_ttl).unwrap_or(chrono::Duration::MAX);
            let expires_at = t
                .updated_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if expires_at <= Utc::now() {
                return Ok(false);
            }
            IdempotencyRecord::completed(&t.client_key, t.fingerprint(), t.result(), expires_at)
        } else {
            IdempotencyRecord::in_flight(
                &t.client_key,
                t.transfer_ref,
                t.fingerprint(),
                self.in_flight_ttl,
            )
        };
        Ok(self.store.put_if_absent(record).await?.is_none())
    }

    /// Record the terminal result for `key`
    pub async fn complete(&self, key: &str, result: &TransferResult) -> Result<(), TransferError> {
        self.store
            .complete(key, result.clone(), self.result_ttl)
            .await
            .map_err(TransferError::from)
    }

    /// Give `key` back when no aggregate was persisted for it
    pub async fn release(&self, key: &str) -> Result<(), TransferError> {
        self.store.release(key).await.map_err(TransferError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use crate::transfer::state::TransferStatus;
    use crate::transfer::types::AccountId;
    use rust_decimal::Decimal;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fingerprint(amount: i64) -> RequestFingerprint {
        RequestFingerprint {
            source: AccountId::from("a"),
            destination: AccountId::from("b"),
            amount: Decimal::from(amount),
            currency: Currency::new("EUR").unwrap(),
        }
    }

    fn guard_with(store: Arc<dyn IdempotencyStore>, in_flight_ttl: Duration) -> IdempotencyGuard {
        IdempotencyGuard::new(store, in_flight_ttl, HOUR)
    }

    struct UnreachableStore;

    #[async_trait]
    impl IdempotencyStore for UnreachableStore {
        async fn put_if_absent(
            &self,
            _record: IdempotencyRecord,
        ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
        async fn complete(
            &self,
            _key: &str,
            _result: TransferResult,
            _ttl: Duration,
        ) -> Result<(), IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
        async fn release(&self, _key: &str) -> Result<(), IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
        async fn renew(
            &self,
            _key: &str,
            _transfer_ref: TransferRef,
            _ttl: Duration,
        ) -> Result<bool, IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
        async fn replace(
            &self,
            _stale: TransferRef,
            _record: IdempotencyRecord,
        ) -> Result<bool, IdempotencyError> {
            Err(IdempotencyError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_fresh_then_in_flight() {
        let guard = guard_with(Arc::new(InMemoryIdempotencyStore::new()), HOUR);

        let first = guard.begin("k1", &fingerprint(300)).await.unwrap();
        let GuardDecision::Fresh(r) = first else {
            panic!("expected fresh, got {first:?}");
        };

        let second = guard.begin("k1", &fingerprint(300)).await.unwrap();
        assert_eq!(second, GuardDecision::InFlight(r));
    }

    #[tokio::test]
    async fn test_complete_then_cached() {
        let guard = guard_with(Arc::new(InMemoryIdempotencyStore::new()), HOUR);
        let GuardDecision::Fresh(r) = guard.begin("k1", &fingerprint(300)).await.unwrap() else {
            panic!("expected fresh");
        };

        let result = TransferResult {
            transfer_ref: r,
            status: TransferStatus::Completed,
            failure_reason: None,
        };
        guard.complete("k1", &result).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                guard.begin("k1", &fingerprint(300)).await.unwrap(),
                GuardDecision::Cached(result.clone())
            );
        }
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_parameters_rejected() {
        let guard = guard_with(Arc::new(InMemoryIdempotencyStore::new()), HOUR);
        guard.begin("k1", &fingerprint(300)).await.unwrap();

        let err = guard.begin("k1", &fingerprint(301)).await.unwrap_err();
        assert!(matches!(err, TransferError::IdempotencyKeyReused));
    }

    #[tokio::test]
    async fn test_expired_in_flight_marker_is_reported_stale() {
        let guard = guard_with(Arc::new(InMemoryIdempotencyStore::new()), Duration::ZERO);
        let GuardDecision::Fresh(first) = guard.begin("k1", &fingerprint(1)).await.unwrap() else {
            panic!("expected fresh");
        };

        // never handed out a second time without the caller deciding
        for _ in 0..2 {
            assert_eq!(
                guard.begin("k1", &fingerprint(1)).await.unwrap(),
                GuardDecision::Stale(first)
            );
        }
    }

    #[tokio::test]
    async fn test_reclaim_swaps_only_the_stale_owner() {
        let guard = guard_with(Arc::new(InMemoryIdempotencyStore::new()), Duration::ZERO);
        let GuardDecision::Fresh(first) = guard.begin("k1", &fingerprint(1)).await.unwrap() else {
            panic!("expected fresh");
        };

        let second = guard.reclaim("k1", first, &fingerprint(1)).await.unwrap();
        let Some(second) = second else {
            panic!("expected the key to be reclaimed");
        };
        assert_ne!(first, second);

        // a second reclaimer holding the old reference loses
        assert_eq!(guard.reclaim("k1", first, &fingerprint(1)).await.unwrap(), None);
        assert_eq!(
            guard.begin("k1", &fingerprint(1)).await.unwrap(),
            GuardDecision::Stale(second)
        );
    }

    #[tokio::test]
    async fn test_adopt_re_arms_marker() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let expired = guard_with(store.clone(), Duration::ZERO);
        let GuardDecision::Fresh(r) = expired.begin("k1", &fingerprint(1)).await.unwrap() else {
            panic!("expected fresh");
        };

        let guard = guard_with(store, HOUR);
        assert!(!guard.adopt("k1", TransferRef::new()).await.unwrap());
        assert!(guard.adopt("k1", r).await.unwrap());
        assert_eq!(
            guard.begin("k1", &fingerprint(1)).await.unwrap(),
            GuardDecision::InFlight(r)
        );
    }

    #[tokio::test]
    async fn test_complete_refuses_foreign_result() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard_with(store.clone(), HOUR);
        let GuardDecision::Fresh(r) = guard.begin("k1", &fingerprint(1)).await.unwrap() else {
            panic!("expected fresh");
        };

        let foreign = TransferResult {
            transfer_ref: TransferRef::new(),
            status: TransferStatus::Completed,
            failure_reason: None,
        };
        let err = store.complete("k1", foreign, HOUR).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::NotOwner { owner, .. } if owner == r));
        assert_eq!(
            store.get("k1").await.unwrap().map(|rec| rec.state),
            Some(IdempotencyState::InFlight)
        );
    }

    #[tokio::test]
    async fn test_restore_from_aggregates() {
        use crate::transfer::types::TransferRequest;

        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard_with(store.clone(), HOUR);
        let req = TransferRequest::new(
            "k-done",
            AccountId::from("a"),
            AccountId::from("b"),
            Decimal::from(1),
            Currency::new("EUR").unwrap(),
        );
        let done = TransferAggregate::new(TransferRef::new(), &req)
            .transition(TransferStatus::Validating)
            .unwrap()
            .reject("insufficient funds")
            .unwrap();
        let mut unfinished_req = req.clone();
        unfinished_req.client_key = "k-open".into();
        let unfinished = TransferAggregate::new(TransferRef::new(), &unfinished_req);

        assert!(guard.restore(&done).await.unwrap());
        assert!(guard.restore(&unfinished).await.unwrap());
        // a second restore leaves live records alone
        assert!(!guard.restore(&done).await.unwrap());

        assert_eq!(
            guard.begin("k-done", &fingerprint(1)).await.unwrap(),
            GuardDecision::Cached(done.result())
        );
        assert_eq!(
            guard.begin("k-open", &fingerprint(1)).await.unwrap(),
            GuardDecision::InFlight(unfinished.transfer_ref)
        );
    }

    #[tokio::test]
    async fn test_release_only_drops_in_flight() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = guard_with(store.clone(), HOUR);

        guard.begin("k1", &fingerprint(1)).await.unwrap();
        guard.release("k1").await.unwrap();
        assert!(store.is_empty());

        let GuardDecision::Fresh(r) = guard.begin("k2", &fingerprint(1)).await.unwrap() else {
            panic!("expected fresh");
        };
        let result = TransferResult {
            transfer_ref: r,
            status: TransferStatus::ValidationFailed,
            failure_reason: Some("insufficient funds".into()),
        };
        guard.complete("k2", &result).await.unwrap();
        guard.release("k2").await.unwrap();
        assert_eq!(store.get("k2").await.unwrap().map(|r| r.state), Some(IdempotencyState::Complete(result)));
    }

    #[tokio::test]
    async fn test_fails_closed_when_store_unreachable() {
        let guard = guard_with(Arc::new(UnreachableStore), HOUR);
        let err = guard.begin("k1", &fingerprint(1)).await.unwrap_err();
        assert!(matches!(err, TransferError::IdempotencyUnavailable(_)));
        assert!(err.is_retryable());
    }
}
