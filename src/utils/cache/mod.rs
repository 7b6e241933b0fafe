use crate::buffer::PageId;

pub mod lru;
pub mod lru_k;

pub use lru::LruEvictionPolicy;
pub use lru_k::LruKEvictionPolicy;

/// Decides which resident pages leave memory.
///
/// A policy only tracks page ids; the page allocator does the actual eviction and
/// hands pinned victims back through `record_usage`.
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    fn in_memory_page_count_limit(&self) -> usize;

    fn record_usage(&self, page_id: PageId);

    /// Removes and returns victims while more pages than the limit are tracked.
    fn pick_victims(&self) -> Vec<PageId>;

    fn forget(&self, page_id: PageId);

    fn tracked_count(&self) -> usize;

    fn record_usage_and_evict(&self, page_id: PageId) -> Vec<PageId> {
        self.record_usage(page_id);
        self.pick_victims()
    }
}
