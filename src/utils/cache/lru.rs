use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::buffer::PageId;
use crate::utils::cache::EvictionPolicy;

#[derive(Debug, Default)]
struct LruState {
    clock: u64,
    last_used: HashMap<PageId, u64>,
    order: BTreeMap<u64, PageId>,
}

impl LruState {
    fn touch(&mut self, page_id: PageId) {
        self.clock += 1;
        if let Some(previous) = self.last_used.insert(page_id, self.clock) {
            self.order.remove(&previous);
        }
        self.order.insert(self.clock, page_id);
    }

    fn remove(&mut self, page_id: PageId) {
        if let Some(previous) = self.last_used.remove(&page_id) {
            self.order.remove(&previous);
        }
    }
}

/// Least recently used first. Once over the limit it reclaims `evict_batch`
/// pages at a time.
#[derive(Debug)]
pub struct LruEvictionPolicy {
    limit: usize,
    evict_batch: usize,
    state: Mutex<LruState>,
}

impl LruEvictionPolicy {
    pub fn new(limit: usize, evict_batch: usize) -> Self {
        Self {
            limit,
            evict_batch: evict_batch.max(1),
            state: Mutex::new(LruState::default()),
        }
    }
}

impl EvictionPolicy for LruEvictionPolicy {
    fn in_memory_page_count_limit(&self) -> usize {
        self.limit
    }

    fn record_usage(&self, page_id: PageId) {
        self.state.lock().touch(page_id);
    }

    fn pick_victims(&self) -> Vec<PageId> {
        let mut state = self.state.lock();
        let tracked = state.last_used.len();
        if tracked <= self.limit {
            return vec![];
        }
        // The most recent page always stays.
        let victims = state
            .order
            .values()
            .take(self.evict_batch.min(tracked - 1))
            .copied()
            .collect::<Vec<_>>();
        for victim in victims.iter() {
            state.remove(*victim);
        }
        victims
    }

    fn forget(&self, page_id: PageId) {
        self.state.lock().remove(page_id);
    }

    fn tracked_count(&self) -> usize {
        self.state.lock().last_used.len()
    }
}
