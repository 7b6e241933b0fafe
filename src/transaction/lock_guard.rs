use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::buffer::PageId;
use crate::transaction::{LockManager, LockMode};

#[derive(Debug, Default, Clone, Copy)]
struct HeldCount {
    shared: usize,
    exclusive: usize,
}

/// Page locks one transaction currently holds.
#[derive(Debug, Default)]
pub struct HeldLocks {
    held: Mutex<HashMap<PageId, HeldCount>>,
}

impl HeldLocks {
    /// An exclusive hold also satisfies a shared check.
    pub fn holds(&self, page_id: PageId, mode: LockMode) -> bool {
        let held = self.held.lock();
        match (held.get(&page_id), mode) {
            (Some(count), LockMode::Shared) => count.shared + count.exclusive > 0,
            (Some(count), LockMode::Exclusive) => count.exclusive > 0,
            (None, _) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    fn acquired(&self, page_id: PageId, mode: LockMode) {
        let mut held = self.held.lock();
        let count = held.entry(page_id).or_default();
        match mode {
            LockMode::Shared => count.shared += 1,
            LockMode::Exclusive => count.exclusive += 1,
        }
    }

    fn released(&self, page_id: PageId, mode: LockMode) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(&page_id) {
            match mode {
                LockMode::Shared => count.shared = count.shared.saturating_sub(1),
                LockMode::Exclusive => count.exclusive = count.exclusive.saturating_sub(1),
            }
            if count.shared == 0 && count.exclusive == 0 {
                held.remove(&page_id);
            }
        }
    }

    fn downgraded(&self, page_id: PageId) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(&page_id) {
            count.exclusive = count.exclusive.saturating_sub(1);
            count.shared += 1;
        }
    }
}

/// A granted page lock. Dropping it releases the lock.
pub struct PageLockGuard<G> {
    manager: Arc<LockManager>,
    held: Arc<HeldLocks>,
    page_id: PageId,
    mode: LockMode,
    guard: Option<G>,
}

pub type SharedPageGuard = PageLockGuard<OwnedRwLockReadGuard<()>>;
pub type ExclusivePageGuard = PageLockGuard<OwnedRwLockWriteGuard<()>>;

impl<G> PageLockGuard<G> {
    pub(crate) fn new(
        manager: Arc<LockManager>,
        held: Arc<HeldLocks>,
        page_id: PageId,
        mode: LockMode,
        guard: G,
    ) -> Self {
        held.acquired(page_id, mode);
        Self {
            manager,
            held,
            page_id,
            mode,
            guard: Some(guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl ExclusivePageGuard {
    /// Turns the exclusive hold into a shared one without letting a writer in.
    pub fn downgrade(mut self) -> SharedPageGuard {
        let guard = self.guard.take().map(OwnedRwLockWriteGuard::downgrade);
        if guard.is_some() {
            self.held.downgraded(self.page_id);
        }
        PageLockGuard {
            manager: self.manager.clone(),
            held: self.held.clone(),
            page_id: self.page_id,
            mode: LockMode::Shared,
            guard,
        }
    }
}

impl<G> Drop for PageLockGuard<G> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            self.held.released(self.page_id, self.mode);
            self.manager.release_idle(self.page_id);
        }
    }
}

/// What `Transaction::acquire_lock` hands out. `Noop` comes from transactions
/// that don't lock.
pub enum LockReleaser {
    Shared(SharedPageGuard),
    Exclusive(ExclusivePageGuard),
    Noop,
}

impl LockReleaser {
    pub fn release(self) {}

    pub fn downgrade(self) -> LockReleaser {
        match self {
            LockReleaser::Exclusive(guard) => LockReleaser::Shared(guard.downgrade()),
            other => other,
        }
    }

    pub fn mode(&self) -> Option<LockMode> {
        match self {
            LockReleaser::Shared(_) => Some(LockMode::Shared),
            LockReleaser::Exclusive(_) => Some(LockMode::Exclusive),
            LockReleaser::Noop => None,
        }
    }
}

impl std::fmt::Debug for LockReleaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockReleaser::Shared(guard) => write!(f, "Shared({})", guard.page_id),
            LockReleaser::Exclusive(guard) => write!(f, "Exclusive({})", guard.page_id),
            LockReleaser::Noop => write!(f, "Noop"),
        }
    }
}
