mod lock_guard;
mod lock_manager;
mod log_record;
mod transaction;

pub use lock_guard::{ExclusivePageGuard, HeldLocks, LockReleaser, PageLockGuard, SharedPageGuard};
pub use lock_manager::{LockManager, LockMode};
pub use log_record::{AllocatePageRecord, LogRecord};
pub use transaction::{
    NotLoggedTransaction, PageLockTransaction, Transaction, TransactionId, TransactionState,
};
