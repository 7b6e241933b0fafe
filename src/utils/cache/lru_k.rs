use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::buffer::PageId;
use crate::utils::cache::EvictionPolicy;

#[derive(Debug, Default)]
struct LruKState {
    // Logical clock, bumped on every recorded access.
    clock: u64,
    // Last k access times of every tracked page, oldest first.
    access_history: HashMap<PageId, VecDeque<u64>>,
}

impl LruKState {
    /// Page with the largest backward k-distance. Pages with fewer than k accesses
    /// count as infinitely distant and go first, oldest first access wins.
    fn victim(&self, k: usize) -> Option<PageId> {
        let mut victim: Option<(PageId, u64)> = None;
        let mut oldest_inf_dist: Option<(PageId, u64)> = None;

        for (page_id, history) in self.access_history.iter() {
            let Some(first) = history.front().copied() else {
                return Some(*page_id);
            };
            if history.len() < k {
                if oldest_inf_dist.map_or(true, |(_, ts)| first < ts) {
                    oldest_inf_dist = Some((*page_id, first));
                }
            } else if victim.map_or(true, |(_, ts)| first < ts) {
                victim = Some((*page_id, first));
            }
        }
        oldest_inf_dist.or(victim).map(|(page_id, _)| page_id)
    }
}

/// LRU-K: evicts one page at a time until the tracked count is back at the limit.
#[derive(Debug)]
pub struct LruKEvictionPolicy {
    limit: usize,
    k: usize,
    state: Mutex<LruKState>,
}

impl LruKEvictionPolicy {
    pub fn new(limit: usize, k: usize) -> Self {
        assert!(k > 0, "k must be greater than 0");
        Self {
            limit,
            k,
            state: Mutex::new(LruKState::default()),
        }
    }
}

impl EvictionPolicy for LruKEvictionPolicy {
    fn in_memory_page_count_limit(&self) -> usize {
        self.limit
    }

    fn record_usage(&self, page_id: PageId) {
        let mut state = self.state.lock();
        state.clock += 1;
        let now = state.clock;
        let history = state.access_history.entry(page_id).or_default();
        history.push_back(now);
        if history.len() > self.k {
            history.pop_front();
        }
    }

    fn pick_victims(&self) -> Vec<PageId> {
        let mut state = self.state.lock();
        let mut victims = vec![];
        while state.access_history.len() > self.limit {
            let Some(victim) = state.victim(self.k) else {
                break;
            };
            state.access_history.remove(&victim);
            victims.push(victim);
        }
        victims
    }

    fn forget(&self, page_id: PageId) {
        self.state.lock().access_history.remove(&page_id);
    }

    fn tracked_count(&self) -> usize {
        self.state.lock().access_history.len()
    }
}
