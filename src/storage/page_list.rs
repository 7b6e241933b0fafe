use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::debug;

use crate::buffer::{PageId, NULL_PAGE_ID};
use crate::catalog::{ColumnInfo, RowLayout};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::{create_initial_page, CollectionType, PageCollection};
use crate::storage::codec::FixedField;
use crate::storage::{PageAllocator, RowHolder};
use crate::transaction::{LockMode, Transaction};

/// Unordered rows in a chain of pages linked through next-page-id.
pub struct PageListCollection {
    root_page_id: PageId,
    last_page_id: AtomicU64,
    allocator: Arc<dyn PageAllocator>,
    columns: Vec<ColumnInfo>,
    row_size: usize,
}

struct ListCursor {
    next_page_id: PageId,
    buffered: VecDeque<RowHolder>,
}

impl PageListCollection {
    pub async fn new(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Self> {
        let row_size = RowLayout::try_new(columns)?.row_size();
        let root = create_initial_page(CollectionType::PageList, columns, allocator.as_ref(), tran)
            .await?;
        debug!("page list created at page {}", root.page_id());
        Ok(Self {
            root_page_id: root.page_id(),
            last_page_id: AtomicU64::new(root.page_id()),
            allocator,
            columns: columns.to_vec(),
            row_size,
        })
    }

    /// Reattaches to a list whose first page already exists.
    pub fn open(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        root_page_id: PageId,
    ) -> QuillStoreResult<Self> {
        let row_size = RowLayout::try_new(columns)?.row_size();
        Ok(Self {
            root_page_id,
            last_page_id: AtomicU64::new(root_page_id),
            allocator,
            columns: columns.to_vec(),
            row_size,
        })
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub async fn count(&self, tran: &dyn Transaction) -> QuillStoreResult<u64> {
        let mut rows = 0u64;
        let mut page_id = self.root_page_id;
        while page_id != NULL_PAGE_ID {
            let _lock = tran.acquire_lock(page_id, LockMode::Shared).await?;
            let page = self
                .allocator
                .get_mixed_page(page_id, tran, &self.columns)
                .await?;
            rows += page.row_count() as u64;
            page_id = page.next_page_id();
        }
        Ok(rows)
    }

    /// Appends `item` to the first page with room, or to a new tail page.
    pub async fn add(&self, item: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()> {
        if item.size() != self.row_size {
            return Err(QuillStoreError::InvalidArgument(format!(
                "row of {} bytes doesn't match collection row size {}",
                item.size(),
                self.row_size
            )));
        }
        loop {
            let mut page_id = self.last_page_id.load(Ordering::Acquire);
            let tail = loop {
                let lock = tran.acquire_lock(page_id, LockMode::Shared).await?;
                let page = self
                    .allocator
                    .get_mixed_page(page_id, tran, &self.columns)
                    .await?;
                if page.can_fit(item) {
                    lock.release();
                    let _write = tran.acquire_lock(page_id, LockMode::Exclusive).await?;
                    // Another writer may have filled it meanwhile.
                    if page.can_fit(item) {
                        page.insert(item)?;
                        return Ok(());
                    }
                }
                let next = page.next_page_id();
                if next == NULL_PAGE_ID {
                    break page;
                }
                page_id = next;
            };

            let _tail_lock = tran.acquire_lock(tail.page_id(), LockMode::Exclusive).await?;
            if tail.next_page_id() != NULL_PAGE_ID {
                continue;
            }
            let page = self
                .allocator
                .allocate_mixed_page(&self.columns, tail.page_id(), NULL_PAGE_ID, tran)
                .await?;
            let _page_lock = tran.acquire_lock(page.page_id(), LockMode::Exclusive).await?;
            page.insert(item)?;
            tail.set_next_page_id(page.page_id());
            self.last_page_id.store(page.page_id(), Ordering::Release);
            return Ok(());
        }
    }

    /// Streams rows page by page. Each page is read under its shared lock.
    pub fn iterate<'a>(
        &'a self,
        tran: &'a dyn Transaction,
    ) -> BoxStream<'a, QuillStoreResult<RowHolder>> {
        let cursor = ListCursor {
            next_page_id: self.root_page_id,
            buffered: VecDeque::new(),
        };
        futures::stream::try_unfold(cursor, move |cursor| self.next_row(cursor, tran)).boxed()
    }

    async fn next_row(
        &self,
        mut cursor: ListCursor,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Option<(RowHolder, ListCursor)>> {
        loop {
            if let Some(row) = cursor.buffered.pop_front() {
                return Ok(Some((row, cursor)));
            }
            if cursor.next_page_id == NULL_PAGE_ID {
                return Ok(None);
            }
            let _lock = tran
                .acquire_lock(cursor.next_page_id, LockMode::Shared)
                .await?;
            let page = self
                .allocator
                .get_mixed_page(cursor.next_page_id, tran, &self.columns)
                .await?;
            cursor.buffered.extend(page.fetch()?);
            cursor.next_page_id = page.next_page_id();
        }
    }

    pub async fn max<U, P>(
        &self,
        projector: P,
        start_min: U,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<U>
    where
        U: PartialOrd + Send,
        P: Fn(&RowHolder) -> U + Send,
    {
        let mut max = start_min;
        let mut rows = self.iterate(tran);
        while let Some(row) = rows.next().await {
            let value = projector(&row?);
            if value > max {
                max = value;
            }
        }
        Ok(max)
    }
}

impl PageCollection for PageListCollection {
    fn column_types(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn supports_seek(&self) -> bool {
        false
    }

    async fn count(&self, tran: &dyn Transaction) -> QuillStoreResult<u64> {
        PageListCollection::count(self, tran).await
    }

    async fn is_empty(&self, tran: &dyn Transaction) -> QuillStoreResult<bool> {
        Ok(PageListCollection::count(self, tran).await? == 0)
    }

    async fn add(&self, item: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()> {
        PageListCollection::add(self, item, tran).await
    }

    fn iterate<'a>(
        &'a self,
        tran: &'a dyn Transaction,
    ) -> BoxStream<'a, QuillStoreResult<RowHolder>> {
        PageListCollection::iterate(self, tran)
    }

    async fn max<U, P>(&self, projector: P, start_min: U, tran: &dyn Transaction) -> QuillStoreResult<U>
    where
        U: PartialOrd + Send,
        P: Fn(&RowHolder) -> U + Send,
    {
        PageListCollection::max(self, projector, start_min, tran).await
    }

    async fn seek<K: FixedField>(&self, _key: K, _tran: &dyn Transaction) -> QuillStoreResult<RowHolder> {
        Err(QuillStoreError::NotImplemented(
            "page list has no seek".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPoolConfig;
    use crate::storage::MemoryPageManager;
    use crate::transaction::{LockManager, NotLoggedTransaction};
    use futures::TryStreamExt;

    fn columns() -> Vec<ColumnInfo> {
        vec![ColumnInfo::int(), ColumnInfo::double()]
    }

    fn allocator() -> Arc<dyn PageAllocator> {
        Arc::new(MemoryPageManager::new(
            BufferPoolConfig::default()
                .with_page_size(128usize)
                .with_eviction_limit(4usize)
                .with_evict_batch(2usize),
        ))
    }

    fn row(key: i32) -> RowHolder {
        let mut row = RowHolder::new(&RowLayout::try_new(&columns()).unwrap());
        row.set_field::<i32>(0, key);
        row.set_field::<f64>(1, key as f64 / 2.0);
        row
    }

    #[tokio::test]
    async fn rows_spill_over_pages() {
        let tran = NotLoggedTransaction;
        let list = PageListCollection::new(allocator(), &columns(), &tran)
            .await
            .unwrap();
        assert!(PageCollection::is_empty(&list, &tran).await.unwrap());

        // 128-byte pages hold 7 rows of 12 bytes, so 40 rows need 6 pages.
        for key in 0..40 {
            list.add(&row(key), &tran).await.unwrap();
        }
        assert_eq!(list.count(&tran).await.unwrap(), 40);

        let keys = list
            .iterate(&tran)
            .map_ok(|r| r.get_field::<i32>(0))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(keys, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn where_and_max() {
        let tran = NotLoggedTransaction;
        let list = PageListCollection::new(allocator(), &columns(), &tran)
            .await
            .unwrap();
        for key in [5, 17, 3, 11, 8] {
            list.add(&row(key), &tran).await.unwrap();
        }
        let odd = list
            .where_rows(|r| r.get_field::<i32>(0) % 2 == 1, &tran)
            .map_ok(|r| r.get_field::<i32>(0))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(odd, vec![5, 17, 3, 11]);

        let max = list
            .max(|r| r.get_field::<f64>(1), f64::MIN, &tran)
            .await
            .unwrap();
        assert_eq!(max, 8.5);
    }

    #[tokio::test]
    async fn seek_not_supported() {
        let tran = NotLoggedTransaction;
        let list = PageListCollection::new(allocator(), &columns(), &tran)
            .await
            .unwrap();
        assert!(!list.supports_seek());
        assert!(matches!(
            PageCollection::seek(&list, 1i32, &tran).await,
            Err(QuillStoreError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn reopen_sees_existing_rows() {
        let tran = NotLoggedTransaction;
        let allocator = allocator();
        let list = PageListCollection::new(allocator.clone(), &columns(), &tran)
            .await
            .unwrap();
        for key in 0..10 {
            list.add(&row(key), &tran).await.unwrap();
        }
        let reopened = PageListCollection::open(allocator, &columns(), list.root_page_id()).unwrap();
        assert_eq!(reopened.count(&tran).await.unwrap(), 10);
        reopened.add(&row(10), &tran).await.unwrap();
        assert_eq!(list.count(&tran).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn wrong_row_size_rejected() {
        let tran = NotLoggedTransaction;
        let list = PageListCollection::new(allocator(), &columns(), &tran)
            .await
            .unwrap();
        assert!(matches!(
            list.add(&RowHolder::zero(), &tran).await,
            Err(QuillStoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_with_page_locks() {
        let lock_manager = Arc::new(LockManager::new());
        let setup = lock_manager.begin();
        let list = Arc::new(
            PageListCollection::new(allocator(), &columns(), &setup)
                .await
                .unwrap(),
        );

        let mut handles = vec![];
        for worker in 0..4 {
            let list = list.clone();
            let tran = lock_manager.begin();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    list.add(&row(worker * 100 + i), &tran).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let tran = lock_manager.begin();
        let mut keys = list
            .iterate(&tran)
            .map_ok(|r| r.get_field::<i32>(0))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        keys.sort();
        let mut expected = (0..4)
            .flat_map(|w| (0..25).map(move |i| w * 100 + i))
            .collect::<Vec<_>>();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(lock_manager.locked_page_count(), 0);
    }
}
