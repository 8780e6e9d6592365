//! Ledger Client
//!
//! The account-of-record service is an external collaborator; the core only
//! talks to it through [`LedgerClient`]. Balance mutations take an
//! [`AccountLock`] for the account they touch, so the only read-modify-write
//! path to a balance is through the lock table.
//!
//! All mutations MUST be idempotent: calling with the same `(account, tag)`
//! again returns the original ledger tx and applies nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::error::LedgerError;
use super::lock::{AccountLock, AccountLocks};
use super::types::{AccountId, LedgerTxId, MutationTag};
use crate::money::Currency;

/// Account status as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

/// Point-in-time view of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub id: AccountId,
    pub balance: Decimal,
    pub currency: Currency,
    pub status: AccountStatus,
    pub version: u64,
}

/// Direction of a balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Debit,
    Credit,
}

/// Ledger client trait
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Get ledger name for logging
    fn name(&self) -> &'static str;

    async fn get_account(&self, id: &AccountId) -> Result<Option<AccountSnapshot>, LedgerError>;

    /// Acquire the account's exclusive lock, waiting at most `wait`
    async fn lock(&self, id: &AccountId, wait: Duration) -> Result<AccountLock, LedgerError>;

    /// Acquire two account locks in global order
    async fn lock_pair(
        &self,
        a: &AccountId,
        b: &AccountId,
        wait: Duration,
    ) -> Result<(AccountLock, AccountLock), LedgerError>;

    /// Debit the locked account
    ///
    /// # Idempotency
    /// If `(account, tag)` was already applied, return the original tx.
    async fn debit(
        &self,
        lock: &AccountLock,
        amount: Decimal,
        tag: &MutationTag,
    ) -> Result<LedgerTxId, LedgerError>;

    /// Credit the locked account
    ///
    /// # Idempotency
    /// If `(account, tag)` was already applied, return the original tx.
    async fn credit(
        &self,
        lock: &AccountLock,
        amount: Decimal,
        tag: &MutationTag,
    ) -> Result<LedgerTxId, LedgerError>;

    /// Look up a mutation previously applied to `account` with `tag`
    async fn find_mutation(
        &self,
        account: &AccountId,
        tag: &MutationTag,
    ) -> Result<Option<LedgerTxId>, LedgerError>;
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// One applied mutation
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub tx_id: LedgerTxId,
    pub account: AccountId,
    pub direction: Direction,
    pub amount: Decimal,
    pub tag: MutationTag,
    pub balance_after: Decimal,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AccountRecord {
    balance: Decimal,
    currency: Currency,
    status: AccountStatus,
    version: u64,
}

/// In-process ledger used by the demo binary and tests
///
/// Rules: debits require an active account and sufficient balance; credits
/// are refused only on closed accounts (refunds into a frozen account are
/// allowed).
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    accounts: DashMap<AccountId, AccountRecord>,
    locks: AccountLocks,
    applied: DashMap<(AccountId, MutationTag), LedgerTxId>,
    entries: Mutex<Vec<LedgerEntry>>,
    next_tx: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or overwrite) an account with an opening balance
    pub fn open_account(
        &self,
        id: AccountId,
        balance: Decimal,
        currency: Currency,
        status: AccountStatus,
    ) {
        self.accounts.insert(
            id,
            AccountRecord {
                balance,
                currency,
                status,
                version: 0,
            },
        );
    }

    pub fn set_status(&self, id: &AccountId, status: AccountStatus) {
        if let Some(mut record) = self.accounts.get_mut(id) {
            record.status = status;
            record.version += 1;
        }
    }

    pub fn balance(&self, id: &AccountId) -> Option<Decimal> {
        self.accounts.get(id).map(|r| r.balance)
    }

    /// Applied mutations in order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Applied mutations for one account and direction
    pub fn count(&self, account: &AccountId, direction: Direction) -> usize {
        self.entries()
            .iter()
            .filter(|e| &e.account == account && e.direction == direction)
            .count()
    }

    fn apply(
        &self,
        lock: &AccountLock,
        direction: Direction,
        amount: Decimal,
        tag: &MutationTag,
    ) -> Result<LedgerTxId, LedgerError> {
        let account = lock.account();
        if !self.locks.issued(lock) {
            return Err(LedgerError::LockNotHeld(account.clone()));
        }

        let key = (account.clone(), tag.clone());
        if let Some(existing) = self.applied.get(&key) {
            debug!(account = %account, tag = %tag, tx_id = %existing.value(), "Mutation already applied");
            return Ok(existing.value().clone());
        }

        let mut record = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::AccountNotFound(account.clone()))?;

        match direction {
            Direction::Debit => {
                if record.status != AccountStatus::Active {
                    return Err(LedgerError::AccountInactive(account.clone()));
                }
                if record.balance < amount {
                    return Err(LedgerError::InsufficientFunds(account.clone()));
                }
                record.balance -= amount;
            }
            Direction::Credit => {
                if record.status == AccountStatus::Closed {
                    return Err(LedgerError::AccountInactive(account.clone()));
                }
                record.balance += amount;
            }
        }
        record.version += 1;
        let balance_after = record.balance;
        drop(record);

        let tx_id = LedgerTxId(format!(
            "ltx-{}",
            self.next_tx.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.applied.insert(key, tx_id.clone());
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LedgerEntry {
                tx_id: tx_id.clone(),
                account: account.clone(),
                direction,
                amount,
                tag: tag.clone(),
                balance_after,
                applied_at: Utc::now(),
            });
        }
        Ok(tx_id)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn name(&self) -> &'static str {
        "InMemory"
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<AccountSnapshot>, LedgerError> {
        Ok(self.accounts.get(id).map(|r| AccountSnapshot {
            id: id.clone(),
            balance: r.balance,
            currency: r.currency.clone(),
            status: r.status,
            version: r.version,
        }))
    }

    async fn lock(&self, id: &AccountId, wait: Duration) -> Result<AccountLock, LedgerError> {
        self.locks.acquire(id, wait).await
    }

    async fn lock_pair(
        &self,
        a: &AccountId,
        b: &AccountId,
        wait: Duration,
    ) -> Result<(AccountLock, AccountLock), LedgerError> {
        self.locks.acquire_pair(a, b, wait).await
    }

    async fn debit(
        &self,
        lock: &AccountLock,
        amount: Decimal,
        tag: &MutationTag,
    ) -> Result<LedgerTxId, LedgerError> {
        self.apply(lock, Direction::Debit, amount, tag)
    }

    async fn credit(
        &self,
        lock: &AccountLock,
        amount: Decimal,
        tag: &MutationTag,
    ) -> Result<LedgerTxId, LedgerError> {
        self.apply(lock, Direction::Credit, amount, tag)
    }

    async fn find_mutation(
        &self,
        account: &AccountId,
        tag: &MutationTag,
    ) -> Result<Option<LedgerTxId>, LedgerError> {
        Ok(self
            .applied
            .get(&(account.clone(), tag.clone()))
            .map(|tx| tx.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::TransferRef;

    const WAIT: Duration = Duration::from_millis(100);

    fn eur() -> Currency {
        Currency::new("EUR").unwrap()
    }

    fn ledger_with(id: &str, balance: i64) -> (InMemoryLedger, AccountId) {
        let ledger = InMemoryLedger::new();
        let account = AccountId::from(id);
        ledger.open_account(account.clone(), Decimal::from(balance), eur(), AccountStatus::Active);
        (ledger, account)
    }

    #[tokio::test]
    async fn test_debit_and_credit() {
        let (ledger, a) = ledger_with("a", 1000);
        let lock = ledger.lock(&a, WAIT).await.unwrap();
        let r = TransferRef::new();

        ledger
            .debit(&lock, Decimal::from(300), &MutationTag::forward(r))
            .await
            .unwrap();
        assert_eq!(ledger.balance(&a), Some(Decimal::from(700)));

        ledger
            .credit(&lock, Decimal::from(300), &MutationTag::compensation(r))
            .await
            .unwrap();
        assert_eq!(ledger.balance(&a), Some(Decimal::from(1000)));
        assert_eq!(ledger.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_same_tag_applies_once() {
        let (ledger, a) = ledger_with("a", 1000);
        let lock = ledger.lock(&a, WAIT).await.unwrap();
        let tag = MutationTag::forward(TransferRef::new());

        let tx1 = ledger.debit(&lock, Decimal::from(100), &tag).await.unwrap();
        let tx2 = ledger.debit(&lock, Decimal::from(100), &tag).await.unwrap();

        assert_eq!(tx1, tx2);
        assert_eq!(ledger.balance(&a), Some(Decimal::from(900)));
        assert_eq!(ledger.count(&a, Direction::Debit), 1);
        assert_eq!(ledger.find_mutation(&a, &tag).await.unwrap(), Some(tx1));
    }

    #[tokio::test]
    async fn test_debit_never_goes_negative() {
        let (ledger, a) = ledger_with("a", 100);
        let lock = ledger.lock(&a, WAIT).await.unwrap();
        let err = ledger
            .debit(&lock, Decimal::from(300), &MutationTag::forward(TransferRef::new()))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds(a.clone()));
        assert_eq!(ledger.balance(&a), Some(Decimal::from(100)));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_frozen_account_rules() {
        let (ledger, a) = ledger_with("a", 100);
        ledger.set_status(&a, AccountStatus::Frozen);
        let lock = ledger.lock(&a, WAIT).await.unwrap();
        let r = TransferRef::new();

        assert!(matches!(
            ledger.debit(&lock, Decimal::ONE, &MutationTag::forward(r)).await,
            Err(LedgerError::AccountInactive(_))
        ));
        // refunds still land
        assert!(
            ledger
                .credit(&lock, Decimal::ONE, &MutationTag::compensation(r))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_foreign_lock_rejected() {
        let (ledger, a) = ledger_with("a", 100);
        let other = AccountLocks::new();
        let foreign = other.acquire(&a, WAIT).await.unwrap();

        let err = ledger
            .debit(&foreign, Decimal::ONE, &MutationTag::forward(TransferRef::new()))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::LockNotHeld(a));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let ledger = InMemoryLedger::new();
        let ghost = AccountId::from("ghost");
        assert!(ledger.get_account(&ghost).await.unwrap().is_none());

        let lock = ledger.lock(&ghost, WAIT).await.unwrap();
        assert!(matches!(
            ledger
                .credit(&lock, Decimal::ONE, &MutationTag::forward(TransferRef::new()))
                .await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }
}
