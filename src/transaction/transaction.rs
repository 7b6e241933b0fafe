use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::PageId;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::transaction::{HeldLocks, LockManager, LockMode, LockReleaser, LogRecord};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

/// Lock and log context threaded through every page access.
pub trait Transaction: Send + Sync {
    fn transaction_id(&self) -> TransactionId;

    fn acquire_lock(
        &self,
        page_id: PageId,
        mode: LockMode,
    ) -> BoxFuture<'_, QuillStoreResult<LockReleaser>>;

    fn verify_lock(&self, page_id: PageId, mode: LockMode) -> bool;

    fn add_record(&self, record: LogRecord) -> QuillStoreResult<()>;

    fn records(&self) -> Vec<LogRecord>;

    fn state(&self) -> TransactionState;

    fn commit(&self) -> QuillStoreResult<()>;

    fn rollback(&self) -> QuillStoreResult<()>;
}

#[derive(Debug)]
pub struct PageLockTransaction {
    txn_id: TransactionId,
    lock_manager: Arc<LockManager>,
    held: Arc<HeldLocks>,
    records: Mutex<Vec<LogRecord>>,
    state: Mutex<TransactionState>,
}

impl PageLockTransaction {
    pub fn new(txn_id: TransactionId, lock_manager: Arc<LockManager>) -> Self {
        Self {
            txn_id,
            lock_manager,
            held: Arc::new(HeldLocks::default()),
            records: Mutex::new(vec![]),
            state: Mutex::new(TransactionState::Running),
        }
    }

    pub fn held_lock_count(&self) -> usize {
        self.held.len()
    }

    fn check_running(&self) -> QuillStoreResult<()> {
        let state = *self.state.lock();
        if state != TransactionState::Running {
            return Err(QuillStoreError::TransactionClosed(format!(
                "transaction {} is {state}",
                self.txn_id
            )));
        }
        Ok(())
    }

    fn finish(&self, state: TransactionState) -> QuillStoreResult<()> {
        self.check_running()?;
        if !self.held.is_empty() {
            return Err(QuillStoreError::Internal(format!(
                "transaction {} still holds {} page locks",
                self.txn_id,
                self.held.len()
            )));
        }
        *self.state.lock() = state;
        debug!("transaction {} {state}", self.txn_id);
        Ok(())
    }
}

impl Transaction for PageLockTransaction {
    fn transaction_id(&self) -> TransactionId {
        self.txn_id
    }

    fn acquire_lock(
        &self,
        page_id: PageId,
        mode: LockMode,
    ) -> BoxFuture<'_, QuillStoreResult<LockReleaser>> {
        async move {
            self.check_running()?;
            let releaser = self
                .lock_manager
                .lock_page(page_id, mode, self.held.clone())
                .await;
            Ok::<_, QuillStoreError>(releaser)
        }
        .boxed()
    }

    fn verify_lock(&self, page_id: PageId, mode: LockMode) -> bool {
        self.held.holds(page_id, mode)
    }

    fn add_record(&self, record: LogRecord) -> QuillStoreResult<()> {
        self.check_running()?;
        self.records.lock().push(record);
        Ok(())
    }

    fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn commit(&self) -> QuillStoreResult<()> {
        self.finish(TransactionState::Committed)
    }

    fn rollback(&self) -> QuillStoreResult<()> {
        self.finish(TransactionState::Aborted)
    }
}

/// Transaction that neither locks nor logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotLoggedTransaction;

impl Transaction for NotLoggedTransaction {
    fn transaction_id(&self) -> TransactionId {
        0
    }

    fn acquire_lock(
        &self,
        _page_id: PageId,
        _mode: LockMode,
    ) -> BoxFuture<'_, QuillStoreResult<LockReleaser>> {
        futures::future::ready(Ok(LockReleaser::Noop)).boxed()
    }

    fn verify_lock(&self, _page_id: PageId, _mode: LockMode) -> bool {
        true
    }

    fn add_record(&self, _record: LogRecord) -> QuillStoreResult<()> {
        Ok(())
    }

    fn records(&self) -> Vec<LogRecord> {
        vec![]
    }

    fn state(&self) -> TransactionState {
        TransactionState::Running
    }

    fn commit(&self) -> QuillStoreResult<()> {
        Err(QuillStoreError::TransactionClosed(
            "not logged transaction can't commit".to_string(),
        ))
    }

    fn rollback(&self) -> QuillStoreResult<()> {
        Err(QuillStoreError::TransactionClosed(
            "not logged transaction can't roll back".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::AllocatePageRecord;
    use std::time::Duration;

    fn begin() -> (Arc<LockManager>, PageLockTransaction) {
        let manager = Arc::new(LockManager::new());
        let tran = manager.begin();
        (manager, tran)
    }

    #[tokio::test]
    async fn lock_check() {
        let (_manager, tran) = begin();
        let _releaser = tran.acquire_lock(1, LockMode::Shared).await.unwrap();
        assert!(tran.verify_lock(1, LockMode::Shared));
        assert!(!tran.verify_lock(2, LockMode::Shared));
    }

    #[tokio::test]
    async fn exclusive_hold_satisfies_shared_check() {
        let (_manager, tran) = begin();
        let _releaser = tran.acquire_lock(1, LockMode::Exclusive).await.unwrap();
        assert!(tran.verify_lock(1, LockMode::Shared));
        assert!(tran.verify_lock(1, LockMode::Exclusive));
    }

    #[tokio::test]
    async fn shared_hold_does_not_satisfy_exclusive_check() {
        let (_manager, tran) = begin();
        let _releaser = tran.acquire_lock(1, LockMode::Shared).await.unwrap();
        assert!(!tran.verify_lock(1, LockMode::Exclusive));
    }

    #[tokio::test]
    async fn commit_with_held_lock_fails() {
        let (_manager, tran) = begin();
        let releaser = tran.acquire_lock(1, LockMode::Shared).await.unwrap();
        assert!(matches!(tran.commit(), Err(QuillStoreError::Internal(_))));
        releaser.release();
        tran.commit().unwrap();
        assert_eq!(tran.state(), TransactionState::Committed);
        assert!(matches!(
            tran.acquire_lock(1, LockMode::Shared).await,
            Err(QuillStoreError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn acquire_loop() {
        let (manager, tran) = begin();
        for page_id in 0..1000 {
            let _releaser = tran.acquire_lock(page_id, LockMode::Shared).await.unwrap();
            assert!(tran.verify_lock(page_id, LockMode::Shared));
        }
        assert_eq!(tran.held_lock_count(), 0);
        assert_eq!(manager.locked_page_count(), 0);
    }

    #[tokio::test]
    async fn downgrade_keeps_writers_out() {
        let manager = Arc::new(LockManager::new());
        let tran1 = Arc::new(manager.begin());
        let tran2 = Arc::new(manager.begin());

        let releaser = tran1.acquire_lock(7, LockMode::Exclusive).await.unwrap();
        let releaser = releaser.downgrade();
        assert_eq!(releaser.mode(), Some(LockMode::Shared));
        assert!(tran1.verify_lock(7, LockMode::Shared));
        assert!(!tran1.verify_lock(7, LockMode::Exclusive));

        // Readers share the downgraded lock, writers wait for it.
        let _reader = tran2.acquire_lock(7, LockMode::Shared).await.unwrap();
        let writer_tran = manager.begin();
        let writer = tokio::time::timeout(
            Duration::from_millis(50),
            writer_tran.acquire_lock(7, LockMode::Exclusive),
        )
        .await;
        assert!(writer.is_err());
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_other_transactions() {
        let manager = Arc::new(LockManager::new());
        let tran1 = Arc::new(manager.begin());
        let tran2 = Arc::new(manager.begin());

        let releaser = tran1.acquire_lock(3, LockMode::Exclusive).await.unwrap();
        let waiter = {
            let tran2 = tran2.clone();
            tokio::spawn(async move {
                let releaser = tran2.acquire_lock(3, LockMode::Shared).await.unwrap();
                tran2.verify_lock(3, LockMode::Shared) && releaser.mode().is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(releaser);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn records_are_kept_in_order() {
        let (_manager, tran) = begin();
        for page_id in 1..=3 {
            tran.add_record(LogRecord::AllocatePage(AllocatePageRecord::new(
                page_id,
                tran.transaction_id(),
                4096,
                0,
                0,
                vec![],
            )))
            .unwrap();
        }
        let records = tran.records();
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.transaction_id() == tran.transaction_id()));
    }

    #[tokio::test]
    async fn not_logged_transaction() {
        let tran = NotLoggedTransaction;
        let releaser = tran.acquire_lock(1, LockMode::Exclusive).await.unwrap();
        assert!(releaser.mode().is_none());
        assert!(tran.verify_lock(1, LockMode::Exclusive));
        assert_eq!(tran.transaction_id(), 0);
        assert!(matches!(
            tran.commit(),
            Err(QuillStoreError::TransactionClosed(_))
        ));
    }
}
