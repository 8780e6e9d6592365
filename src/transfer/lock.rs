//! Per-account exclusive locks
//!
//! One async mutex per account id, shared by every transfer touching that
//! account. Guards are RAII: dropping an [`AccountLock`] (normal return, `?`,
//! panic unwind or task cancellation) releases the account.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::error::LedgerError;
use super::types::AccountId;

/// Exclusive hold on one account. Mutations require a reference to it.
#[derive(Debug)]
pub struct AccountLock {
    account: AccountId,
    cell: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl AccountLock {
    pub fn account(&self) -> &AccountId {
        &self.account
    }
}

/// Lock table keyed by account id
#[derive(Debug, Default)]
pub struct AccountLocks {
    cells: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, account: &AccountId) -> Arc<Mutex<()>> {
        self.cells
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire `account` exclusively, waiting at most `wait`
    pub async fn acquire(
        &self,
        account: &AccountId,
        wait: Duration,
    ) -> Result<AccountLock, LedgerError> {
        let cell = self.cell(account);
        let guard = tokio::time::timeout(wait, cell.clone().lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout(account.clone()))?;
        debug!(account = %account, "Account lock acquired");
        Ok(AccountLock {
            account: account.clone(),
            cell,
            _guard: guard,
        })
    }

    /// Acquire two accounts in global (lexicographic) order
    ///
    /// Returned in the caller's argument order. `wait` bounds each acquisition.
    pub async fn acquire_pair(
        &self,
        a: &AccountId,
        b: &AccountId,
        wait: Duration,
    ) -> Result<(AccountLock, AccountLock), LedgerError> {
        if a <= b {
            let first = self.acquire(a, wait).await?;
            let second = self.acquire(b, wait).await?;
            Ok((first, second))
        } else {
            let first = self.acquire(b, wait).await?;
            let second = self.acquire(a, wait).await?;
            Ok((second, first))
        }
    }

    /// Whether `lock` was issued by this table for its account
    pub fn issued(&self, lock: &AccountLock) -> bool {
        self.cells
            .get(&lock.account)
            .is_some_and(|cell| Arc::ptr_eq(cell.value(), &lock.cell))
    }
}
