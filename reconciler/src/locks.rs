//! Per-payment mutual exclusion.
//!
//! Transactions of one batch are reconciled concurrently. Two of them may
//! touch the same payment (address reuse, or the same transaction listed
//! twice), so every read-modify-write of a payment runs under a lock keyed
//! by the payment id. Creating a payment for a transaction is serialized
//! under a lock keyed by its normalized id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tally_types::{NormalizedTxId, PaymentId};
use tokio::sync::OwnedMutexGuard;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKey {
    Payment(PaymentId),
    Transaction(NormalizedTxId),
}

/// Lazily created async locks, one per key. An entry is removed again when
/// its last holder releases it, so the map only holds keys in use.
#[derive(Default)]
pub struct PaymentLocks {
    entries: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PaymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: LockKey) -> PaymentLockGuard<'_> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key).or_default())
        };
        let guard = entry.lock_owned().await;
        PaymentLockGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct PaymentLockGuard<'a> {
    locks: &'a PaymentLocks,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PaymentLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut entries = self
            .locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map holds the lock once nobody is holding or waiting.
        if entries
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = PaymentLocks::new();
        let key = LockKey::Payment(PaymentId::random());
        {
            let _guard = locks.lock(key).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(PaymentLocks::new());
        let key = LockKey::Payment(PaymentId::random());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = PaymentLocks::new();
        let _a = locks.lock(LockKey::Payment(PaymentId::random())).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(LockKey::Transaction(NormalizedTxId::new([1; 32]))),
        )
        .await
        .expect("independent key should not wait");
        assert_eq!(locks.active(), 2);
    }
}
