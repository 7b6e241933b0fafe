use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::trace;
use tokio::sync::RwLock;

use crate::buffer::PageId;
use crate::transaction::{HeldLocks, LockReleaser, PageLockGuard, PageLockTransaction, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One async reader-writer lock per page id, created on first use and dropped
/// once nobody holds or waits for it.
#[derive(Debug)]
pub struct LockManager {
    page_locks: DashMap<PageId, Arc<RwLock<()>>>,
    next_txn_id: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            page_locks: DashMap::new(),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Starts a locking transaction with a fresh id.
    pub fn begin(self: &Arc<Self>) -> PageLockTransaction {
        let txn_id: TransactionId = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        PageLockTransaction::new(txn_id, self.clone())
    }

    pub async fn lock_page(
        self: &Arc<Self>,
        page_id: PageId,
        mode: LockMode,
        held: Arc<HeldLocks>,
    ) -> LockReleaser {
        let lock = self
            .page_locks
            .entry(page_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();
        trace!("waiting {mode} lock on page {page_id}");
        match mode {
            LockMode::Shared => {
                let guard = lock.read_owned().await;
                LockReleaser::Shared(PageLockGuard::new(self.clone(), held, page_id, mode, guard))
            }
            LockMode::Exclusive => {
                let guard = lock.write_owned().await;
                LockReleaser::Exclusive(PageLockGuard::new(
                    self.clone(),
                    held,
                    page_id,
                    mode,
                    guard,
                ))
            }
        }
    }

    /// Drops the page's lock entry when the map holds its last reference.
    pub(crate) fn release_idle(&self, page_id: PageId) {
        self.page_locks
            .remove_if(&page_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn locked_page_count(&self) -> usize {
        self.page_locks.len()
    }
}
