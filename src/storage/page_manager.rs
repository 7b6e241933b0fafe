use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{BufferPool, ChunkToken, MixedPage, PageId, NULL_PAGE_ID};
use crate::catalog::{ColumnInfo, RowLayout, RowLayoutRef};
use crate::config::BufferPoolConfig;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::transaction::{AllocatePageRecord, LogRecord, Transaction};
use crate::utils::cache::{EvictionPolicy, LruEvictionPolicy};

/// Hands out pages to collections.
pub trait PageAllocator: Send + Sync {
    fn allocate_mixed_page<'a>(
        &'a self,
        columns: &'a [ColumnInfo],
        prev_page_id: PageId,
        next_page_id: PageId,
        tran: &'a dyn Transaction,
    ) -> BoxFuture<'a, QuillStoreResult<Arc<MixedPage>>>;

    fn get_mixed_page<'a>(
        &'a self,
        page_id: PageId,
        tran: &'a dyn Transaction,
        columns: &'a [ColumnInfo],
    ) -> BoxFuture<'a, QuillStoreResult<Arc<MixedPage>>>;

    fn page_size(&self) -> usize;
}

/// Page allocator over a `BufferPool`, with evicted pages kept as byte images.
///
/// Pages referenced outside the pool are pinned and never evicted.
pub struct MemoryPageManager {
    pool: BufferPool,
    eviction_policy: Box<dyn EvictionPolicy>,
    next_page_id: AtomicU64,
    persisted: DashMap<PageId, Bytes>,
    layouts: DashMap<Vec<ColumnInfo>, RowLayoutRef>,
    // Serializes evictions with reloads so a reload never misses a page image.
    residency: Mutex<()>,
}

impl MemoryPageManager {
    pub fn new(config: BufferPoolConfig) -> Self {
        let policy = LruEvictionPolicy::new(config.eviction_limit, config.evict_batch);
        Self::with_eviction_policy(config, Box::new(policy))
    }

    /// The arena is sized from the policy's limit rather than `config.eviction_limit`.
    pub fn with_eviction_policy(
        config: BufferPoolConfig,
        eviction_policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        let config = config.with_eviction_limit(eviction_policy.in_memory_page_count_limit());
        Self {
            pool: BufferPool::new(config),
            eviction_policy,
            next_page_id: AtomicU64::new(NULL_PAGE_ID + 1),
            persisted: DashMap::new(),
            layouts: DashMap::new(),
            residency: Mutex::new(()),
        }
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn eviction_policy(&self) -> &dyn EvictionPolicy {
        self.eviction_policy.as_ref()
    }

    pub fn persisted_page_count(&self) -> usize {
        self.persisted.len()
    }

    /// Saves the image of every dirty resident page. Returns how many were saved.
    pub fn flush_dirty_pages(&self) -> usize {
        let dirty = self.pool.get_all_dirty_pages();
        for page in dirty.iter() {
            self.persisted.insert(page.page_id(), page.persist());
        }
        debug!("flushed {} dirty pages", dirty.len());
        dirty.len()
    }

    fn layout_for(&self, columns: &[ColumnInfo]) -> QuillStoreResult<RowLayoutRef> {
        if let Some(layout) = self.layouts.get(columns) {
            return Ok(layout.value().clone());
        }
        let layout = Arc::new(RowLayout::try_new(columns)?);
        Ok(self
            .layouts
            .entry(columns.to_vec())
            .or_insert(layout)
            .value()
            .clone())
    }

    fn allocate(
        &self,
        columns: &[ColumnInfo],
        prev_page_id: PageId,
        next_page_id: PageId,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Arc<MixedPage>> {
        let layout = self.layout_for(columns)?;
        let token = {
            let residency = self.residency.lock();
            self.take_chunk(&residency)?
        };
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        let page = match MixedPage::format(
            self.pool.arena().clone(),
            token,
            page_id,
            layout,
            prev_page_id,
            next_page_id,
        ) {
            Ok(page) => Arc::new(page),
            Err(e) => {
                self.pool.release_memory(token)?;
                return Err(e);
            }
        };
        let page = self.pool.add_page(page)?;
        tran.add_record(LogRecord::AllocatePage(AllocatePageRecord::new(
            page_id,
            tran.transaction_id(),
            self.pool.page_size() as u32,
            prev_page_id,
            next_page_id,
            columns.to_vec(),
        )))?;
        trace!("allocated page {page_id} in chunk {token}");
        self.record_usage(page_id)?;
        Ok(page)
    }

    fn get(
        &self,
        page_id: PageId,
        columns: &[ColumnInfo],
    ) -> QuillStoreResult<Arc<MixedPage>> {
        let page = match self.pool.get_page(page_id) {
            Some(page) => page,
            None => self.reload(page_id, columns)?,
        };
        if page.layout().columns() != columns {
            return Err(QuillStoreError::InvalidArgument(format!(
                "page {page_id} holds {} rows, not {}",
                page.layout(),
                RowLayout::try_new(columns)?
            )));
        }
        self.record_usage(page_id)?;
        Ok(page)
    }

    fn reload(&self, page_id: PageId, columns: &[ColumnInfo]) -> QuillStoreResult<Arc<MixedPage>> {
        let residency = self.residency.lock();
        if let Some(page) = self.pool.get_page(page_id) {
            return Ok(page);
        }
        let image = self
            .persisted
            .get(&page_id)
            .map(|entry| entry.value().clone())
            .ok_or(QuillStoreError::PageNotFound(page_id))?;
        let layout = self.layout_for(columns)?;
        let token = self.take_chunk(&residency)?;
        let page = match MixedPage::load(self.pool.arena().clone(), token, layout, &image) {
            Ok(page) => Arc::new(page),
            Err(e) => {
                self.pool.release_memory(token)?;
                return Err(e);
            }
        };
        debug!("reloaded page {page_id} into chunk {token}");
        self.pool.add_page(page)
    }

    /// Frees a chunk first when the arena is full.
    fn take_chunk(&self, residency: &MutexGuard<'_, ()>) -> QuillStoreResult<ChunkToken> {
        if !self.pool.has_free_chunk() {
            let victims = self.eviction_policy.pick_victims();
            self.evict(residency, victims)?;
        }
        self.pool.get_memory()
    }

    fn record_usage(&self, page_id: PageId) -> QuillStoreResult<()> {
        let victims = self.eviction_policy.record_usage_and_evict(page_id);
        if victims.is_empty() {
            return Ok(());
        }
        let residency = self.residency.lock();
        self.evict(&residency, victims)
    }

    fn evict(&self, _residency: &MutexGuard<'_, ()>, victims: Vec<PageId>) -> QuillStoreResult<()> {
        for victim in victims {
            match self.pool.remove_page_if_unpinned(victim) {
                Some(page) => {
                    if page.is_dirty() {
                        self.persisted.insert(victim, page.persist());
                    }
                    let token = page.token();
                    drop(page);
                    self.pool.release_memory(token)?;
                    trace!("evicted page {victim} from chunk {token}");
                }
                None if self.pool.get_page(victim).is_some() => {
                    warn!("page {victim} is still referenced, keeping it resident");
                    self.eviction_policy.record_usage(victim);
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl PageAllocator for MemoryPageManager {
    fn allocate_mixed_page<'a>(
        &'a self,
        columns: &'a [ColumnInfo],
        prev_page_id: PageId,
        next_page_id: PageId,
        tran: &'a dyn Transaction,
    ) -> BoxFuture<'a, QuillStoreResult<Arc<MixedPage>>> {
        futures::future::ready(self.allocate(columns, prev_page_id, next_page_id, tran)).boxed()
    }

    fn get_mixed_page<'a>(
        &'a self,
        page_id: PageId,
        _tran: &'a dyn Transaction,
        columns: &'a [ColumnInfo],
    ) -> BoxFuture<'a, QuillStoreResult<Arc<MixedPage>>> {
        futures::future::ready(self.get(page_id, columns)).boxed()
    }

    fn page_size(&self) -> usize {
        self.pool.page_size()
    }
}

impl std::fmt::Debug for MemoryPageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPageManager")
            .field("pages_in_pool", &self.pool.pages_in_pool())
            .field("persisted", &self.persisted.len())
            .field("eviction_policy", &self.eviction_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RowHolder;
    use crate::transaction::{LockManager, NotLoggedTransaction};
    use crate::utils::cache::LruKEvictionPolicy;

    fn columns() -> Vec<ColumnInfo> {
        vec![ColumnInfo::int(), ColumnInfo::double()]
    }

    fn page_manager(limit: usize, batch: usize) -> MemoryPageManager {
        MemoryPageManager::new(
            BufferPoolConfig::default()
                .with_page_size(4096usize)
                .with_eviction_limit(limit)
                .with_evict_batch(batch),
        )
    }

    #[tokio::test]
    async fn buffer_pool_check() {
        let manager = page_manager(10, 5);
        let tran = NotLoggedTransaction;
        for _ in 0..3 {
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await
                .unwrap();
        }
        assert_eq!(manager.buffer_pool().pages_in_pool(), 3);
    }

    #[tokio::test]
    async fn buffer_pool_after_eviction() {
        let manager = page_manager(10, 5);
        let tran = NotLoggedTransaction;
        for _ in 0..11 {
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await
                .unwrap();
        }
        assert_eq!(manager.buffer_pool().pages_in_pool(), 6);
        assert_eq!(manager.persisted_page_count(), 5);
        assert_eq!(manager.buffer_pool().free_chunk_count(), 5);
    }

    #[tokio::test]
    async fn evicted_page_reloads_with_its_rows() {
        let manager = page_manager(2, 1);
        let tran = NotLoggedTransaction;
        let layout = RowLayout::try_new(&columns()).unwrap();

        let first = manager
            .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
            .await
            .unwrap();
        let first_id = first.page_id();
        let mut row = RowHolder::new(&layout);
        row.set_field::<i32>(0, 11);
        row.set_field::<f64>(1, 1.5);
        first.insert(&row).unwrap();
        drop(first);

        for _ in 0..3 {
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await
                .unwrap();
        }
        assert!(manager.buffer_pool().get_page(first_id).is_none());

        let reloaded = manager
            .get_mixed_page(first_id, &tran, &columns())
            .await
            .unwrap();
        assert_eq!(reloaded.fetch().unwrap(), vec![row]);
        assert!(!reloaded.is_dirty());
    }

    #[tokio::test]
    async fn pinned_pages_survive_eviction() {
        let manager = page_manager(2, 2);
        let tran = NotLoggedTransaction;
        let mut pinned = vec![];
        for _ in 0..3 {
            pinned.push(
                manager
                    .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(manager.buffer_pool().pages_in_pool(), 3);
        assert!(matches!(
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await,
            Err(QuillStoreError::BufferPoolExhausted)
        ));

        pinned.clear();
        manager
            .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
            .await
            .unwrap();
        assert!(manager.buffer_pool().pages_in_pool() <= 3);
    }

    #[tokio::test]
    async fn unknown_page_not_found() {
        let manager = page_manager(4, 1);
        let tran = NotLoggedTransaction;
        assert!(matches!(
            manager.get_mixed_page(99, &tran, &columns()).await,
            Err(QuillStoreError::PageNotFound(99))
        ));
    }

    #[tokio::test]
    async fn column_mismatch_rejected() {
        let manager = page_manager(4, 1);
        let tran = NotLoggedTransaction;
        let page = manager
            .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .get_mixed_page(page.page_id(), &tran, &[ColumnInfo::int()])
                .await,
            Err(QuillStoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn allocation_is_logged() {
        let manager = page_manager(4, 1);
        let lock_manager = Arc::new(LockManager::new());
        let tran = lock_manager.begin();
        let page = manager
            .allocate_mixed_page(&columns(), 5, NULL_PAGE_ID, &tran)
            .await
            .unwrap();
        let records = tran.records();
        assert_eq!(records.len(), 1);
        let LogRecord::AllocatePage(record) = &records[0];
        assert_eq!(record.page_id, page.page_id());
        assert_eq!(record.prev_page_id, 5);
        assert_eq!(record.page_size, 4096);
        assert_eq!(record.columns, columns());
    }

    #[tokio::test]
    async fn flush_persists_dirty_pages() {
        let manager = page_manager(4, 1);
        let tran = NotLoggedTransaction;
        for _ in 0..3 {
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await
                .unwrap();
        }
        assert_eq!(manager.flush_dirty_pages(), 3);
        assert_eq!(manager.flush_dirty_pages(), 0);
        assert_eq!(manager.persisted_page_count(), 3);
    }

    #[tokio::test]
    async fn lru_k_policy_sizes_the_arena() {
        let manager = MemoryPageManager::with_eviction_policy(
            BufferPoolConfig::default().with_page_size(256usize),
            Box::new(LruKEvictionPolicy::new(3, 2)),
        );
        let tran = NotLoggedTransaction;
        assert_eq!(manager.buffer_pool().free_chunk_count(), 4);
        for _ in 0..8 {
            manager
                .allocate_mixed_page(&columns(), NULL_PAGE_ID, NULL_PAGE_ID, &tran)
                .await
                .unwrap();
        }
        assert!(manager.buffer_pool().pages_in_pool() <= 4);
        assert_eq!(
            manager.buffer_pool().pages_in_pool() + manager.buffer_pool().free_chunk_count(),
            4
        );
    }
}
