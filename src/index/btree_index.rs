use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, trace, warn};

use crate::buffer::{MixedPage, PageId, NULL_PAGE_ID, PAGE_HEADER_SIZE};
use crate::catalog::{ColumnInfo, ColumnType, RowLayout};
use crate::config::BTreeConfig;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::{create_initial_page, BTreeCursor, CollectionType, PageCollection};
use crate::storage::codec::{FieldValue, FixedField};
use crate::storage::{ExtendColumn, PageAllocator, ProjectExtendInfo, RowHolder};
use crate::transaction::{LockMode, LockReleaser, Transaction};
use crate::utils::util::pretty_format_page;

/// Orders two user rows. Must agree with the natural order of the index column.
pub type RowComparator = Arc<dyn Fn(&RowHolder, &RowHolder) -> Ordering + Send + Sync>;

/// Smallest node fan-out for which every split leaves both halves non-empty.
const MIN_ELEMENTS_PER_PAGE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    Int,
    Double,
    PagePointer,
}

impl IndexKind {
    fn try_from_column(column_type: ColumnType) -> QuillStoreResult<Self> {
        match column_type {
            ColumnType::Int => Ok(IndexKind::Int),
            ColumnType::Double => Ok(IndexKind::Double),
            ColumnType::PagePointer => Ok(IndexKind::PagePointer),
            ColumnType::String | ColumnType::StringPointer => Err(
                QuillStoreError::NotImplemented(format!("b+tree index on {column_type} column")),
            ),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            IndexKind::Int => ColumnType::Int,
            IndexKind::Double => ColumnType::Double,
            IndexKind::PagePointer => ColumnType::PagePointer,
        }
    }
}

/// A tree page together with the transaction lock protecting it.
pub(crate) struct HeldPage {
    pub(crate) page: Arc<MixedPage>,
    lock: LockReleaser,
}

impl HeldPage {
    pub(crate) fn page_id(&self) -> PageId {
        self.page.page_id()
    }
}

enum InsertStep {
    Done,
    NeedsSplit,
}

/// Ordered index over pages whose rows carry a trailing child pointer column.
///
/// Internal rows are separators: every key in the child named by a row's pointer
/// is greater than the row's key and smaller than the next row's key. A page's
/// prev-page-id names the child holding keys smaller than its first row. Leaves
/// are flagged through the lowest bit of next-page-id.
///
/// Concurrency: every descent is hand-over-hand and top-down, a child is locked
/// while its parent is still held. An insert first walks under shared locks and
/// upgrades only the leaf. When a split is needed it walks again from the root
/// under exclusive locks.
pub struct BTreeCollection {
    root_page_id: AtomicU64,
    allocator: Arc<dyn PageAllocator>,
    columns: Vec<ColumnInfo>,
    btree_columns: Vec<ColumnInfo>,
    max_elements_per_page: usize,
    index_position: usize,
    pointer_position: usize,
    index_kind: IndexKind,
    comparator: RowComparator,
    add_pointer: ProjectExtendInfo,
    remove_pointer: Vec<usize>,
    row_size: usize,
    config: BTreeConfig,
}

impl BTreeCollection {
    pub async fn new(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        comparator: RowComparator,
        index_position: usize,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Self> {
        Self::new_with_config(
            allocator,
            columns,
            comparator,
            index_position,
            BTreeConfig::default(),
            tran,
        )
        .await
    }

    pub async fn new_with_config(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        comparator: RowComparator,
        index_position: usize,
        config: BTreeConfig,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Self> {
        let tree = Self::build(allocator, columns, comparator, index_position, config)?;
        let root =
            create_initial_page(CollectionType::BTree, columns, tree.allocator.as_ref(), tran)
                .await?;
        {
            let _lock = tran.acquire_lock(root.page_id(), LockMode::Exclusive).await?;
            root.set_leaf(true);
        }
        tree.root_page_id
            .store(root.page_id(), AtomicOrdering::Release);
        debug!(
            "b+tree created at page {} with {} elements per page",
            root.page_id(),
            tree.max_elements_per_page
        );
        Ok(tree)
    }

    /// Reattaches to a tree whose root page already exists.
    pub async fn open(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        comparator: RowComparator,
        index_position: usize,
        root_page_id: PageId,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<Self> {
        let tree = Self::build(
            allocator,
            columns,
            comparator,
            index_position,
            BTreeConfig::default(),
        )?;
        tree.root_page_id
            .store(root_page_id, AtomicOrdering::Release);
        // Fails when the page is unknown or holds rows of another shape.
        tree.lock_page(root_page_id, LockMode::Shared, tran).await?;
        Ok(tree)
    }

    fn build(
        allocator: Arc<dyn PageAllocator>,
        columns: &[ColumnInfo],
        comparator: RowComparator,
        index_position: usize,
        config: BTreeConfig,
    ) -> QuillStoreResult<Self> {
        let layout = RowLayout::try_new(columns)?;
        let index_column = layout.column_with_index(index_position)?;
        let index_kind = IndexKind::try_from_column(index_column.column_type())?;
        let btree_layout = layout.with_page_pointer()?;

        let page_size = allocator.page_size();
        let natural_capacity =
            page_size.saturating_sub(PAGE_HEADER_SIZE) / btree_layout.row_size();
        let max_elements_per_page = if natural_capacity % 2 == 0 {
            natural_capacity.saturating_sub(1)
        } else {
            natural_capacity
        };
        if max_elements_per_page < MIN_ELEMENTS_PER_PAGE {
            return Err(QuillStoreError::InvalidArgument(format!(
                "page of {page_size} bytes holds {natural_capacity} rows of {} bytes, b+tree needs {MIN_ELEMENTS_PER_PAGE}",
                btree_layout.row_size()
            )));
        }

        let add_pointer = ProjectExtendInfo::append(
            columns.len(),
            vec![ExtendColumn::new(
                ColumnInfo::page_pointer(),
                Some(FieldValue::PagePointer(NULL_PAGE_ID)),
            )],
        )?;
        Ok(Self {
            root_page_id: AtomicU64::new(NULL_PAGE_ID),
            allocator,
            columns: columns.to_vec(),
            btree_columns: btree_layout.columns().to_vec(),
            max_elements_per_page,
            index_position,
            pointer_position: columns.len(),
            index_kind,
            comparator,
            add_pointer,
            remove_pointer: (0..columns.len()).collect(),
            row_size: layout.row_size(),
            config,
        })
    }

    /// Comparator ordering rows by the fixed-width column `col`.
    pub fn column_comparator<T: FixedField>(col: usize) -> RowComparator {
        Arc::new(move |left: &RowHolder, right: &RowHolder| {
            left.get_field::<T>(col).compare(&right.get_field::<T>(col))
        })
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(AtomicOrdering::Acquire)
    }

    pub fn max_elements_per_page(&self) -> usize {
        self.max_elements_per_page
    }

    pub fn index_position(&self) -> usize {
        self.index_position
    }

    pub(crate) fn pointer_position(&self) -> usize {
        self.pointer_position
    }

    /// Column positions of the user row inside a node row.
    pub(crate) fn user_positions(&self) -> &[usize] {
        &self.remove_pointer
    }

    pub(crate) fn btree_columns(&self) -> &[ColumnInfo] {
        &self.btree_columns
    }

    pub(crate) async fn lock_page(
        &self,
        page_id: PageId,
        mode: LockMode,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<HeldPage> {
        let lock = tran.acquire_lock(page_id, mode).await?;
        let page = self
            .allocator
            .get_mixed_page(page_id, tran, &self.btree_columns)
            .await?;
        Ok(HeldPage { page, lock })
    }

    /// Locks the current root, retrying when the root moved while waiting.
    pub(crate) async fn lock_root(
        &self,
        mode: LockMode,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<HeldPage> {
        loop {
            let root_page_id = self.root_page_id();
            let root = self.lock_page(root_page_id, mode, tran).await?;
            if self.root_page_id() == root_page_id {
                return Ok(root);
            }
            trace!("root moved away from page {root_page_id}, locking again");
        }
    }

    /// Inserts `item`. Fails with `KeyAlreadyExists` when its key is present.
    pub async fn add(&self, item: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()> {
        if item.column_count() != self.columns.len() || item.size() != self.row_size {
            return Err(QuillStoreError::RowTooLarge(format!(
                "row of {} columns and {} bytes doesn't match index row of {} columns and {} bytes",
                item.column_count(),
                item.size(),
                self.columns.len(),
                self.row_size
            )));
        }
        let row = item.project_and_extend(&self.add_pointer)?;
        match self.insert_shared(&row, tran).await? {
            InsertStep::Done => Ok(()),
            InsertStep::NeedsSplit => {
                trace!("insert needs a split, descending again under exclusive locks");
                self.insert_exclusive(&row, tran).await
            }
        }
    }

    /// Descends under shared locks and inserts when the leaf has room. Only the
    /// leaf is upgraded, while its parent stays share-locked so that no split
    /// can move the leaf's key range meanwhile.
    async fn insert_shared(
        &self,
        row: &RowHolder,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<InsertStep> {
        let mut parent: Option<HeldPage> = None;
        let mut curr = self.lock_root(LockMode::Shared, tran).await?;
        while !curr.page.is_leaf() {
            debug_assert!(tran.verify_lock(curr.page_id(), LockMode::Shared));
            self.check_not_present(&curr.page, row)?;
            if self.is_full(&curr.page) {
                return Ok(InsertStep::NeedsSplit);
            }
            let child_page_id = self.find_child(&curr.page, row)?;
            trace!("descending from page {} to {child_page_id}", curr.page_id());
            let child = self.lock_page(child_page_id, LockMode::Shared, tran).await?;
            parent = Some(curr);
            curr = child;
        }
        self.check_not_present(&curr.page, row)?;
        if self.is_full(&curr.page) {
            return Ok(InsertStep::NeedsSplit);
        }

        let curr_page_id = curr.page_id();
        let HeldPage { page, lock } = curr;
        lock.release();
        let _write = tran.acquire_lock(curr_page_id, LockMode::Exclusive).await?;
        // A root leaf has no parent to pin it and may have been split meanwhile.
        let reachable = parent.is_some() || self.root_page_id() == curr_page_id;
        if !reachable || self.is_full(&page) {
            return Ok(InsertStep::NeedsSplit);
        }
        self.check_not_present(&page, row)?;
        page.insert_ordered(row, self.index_position)?;
        trace!("inserted into leaf {curr_page_id}");
        self.dump_page(&page);
        Ok(InsertStep::Done)
    }

    /// Descends from the root under exclusive locks, splitting every full page on
    /// the way. The page above `curr` stays locked until `curr` is, so a page's
    /// key range never changes between routing to it and locking it.
    async fn insert_exclusive(&self, row: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()> {
        let mut parent: Option<HeldPage> = None;
        let mut curr = self.lock_root(LockMode::Exclusive, tran).await?;
        loop {
            debug_assert!(tran.verify_lock(curr.page_id(), LockMode::Exclusive));
            self.check_not_present(&curr.page, row)?;
            if self.is_full(&curr.page) {
                let (sibling, new_root) = self.prepare_split(parent.is_none(), tran).await?;
                let median =
                    self.split_page(parent.as_ref(), &curr, &sibling, new_root.as_ref())?;
                debug!(
                    "split {} page {} into {}",
                    if curr.page.is_leaf() { "leaf" } else { "internal" },
                    curr.page_id(),
                    sibling.page_id()
                );
                parent = parent.or(new_root);
                curr = match (self.comparator)(row, &median) {
                    Ordering::Less => curr,
                    Ordering::Greater => sibling,
                    Ordering::Equal => return Err(QuillStoreError::KeyAlreadyExists),
                };
            }
            if curr.page.is_leaf() {
                curr.page.insert_ordered(row, self.index_position)?;
                trace!("inserted into leaf {}", curr.page_id());
                self.dump_page(&curr.page);
                return Ok(());
            }
            let child_page_id = self.find_child(&curr.page, row)?;
            drop(parent.take());
            let child = self
                .lock_page(child_page_id, LockMode::Exclusive, tran)
                .await?;
            parent = Some(curr);
            curr = child;
        }
    }

    /// A full leaf has no free slot. An internal page counts as full two slots
    /// early so that it always has room for a separator from a child split.
    fn is_full(&self, page: &MixedPage) -> bool {
        if page.is_leaf() {
            page.row_count() >= self.max_elements_per_page
        } else {
            page.row_count() + 2 >= self.max_elements_per_page
        }
    }

    /// Allocates the split sibling and, when the root splits, the new root. Both
    /// come back exclusively locked.
    async fn prepare_split(
        &self,
        needs_new_root: bool,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<(HeldPage, Option<HeldPage>)> {
        let sibling = self.allocate_locked(tran).await?;
        let new_root = if needs_new_root {
            Some(self.allocate_locked(tran).await?)
        } else {
            None
        };
        Ok((sibling, new_root))
    }

    async fn allocate_locked(&self, tran: &dyn Transaction) -> QuillStoreResult<HeldPage> {
        let page = self
            .allocator
            .allocate_mixed_page(&self.btree_columns, NULL_PAGE_ID, NULL_PAGE_ID, tran)
            .await?;
        let lock = tran
            .acquire_lock(page.page_id(), LockMode::Exclusive)
            .await?;
        Ok(HeldPage { page, lock })
    }

    /// Splits `curr` into `sibling` and places the median above them. Every page
    /// involved is exclusively locked and nothing here suspends.
    fn split_page(
        &self,
        parent: Option<&HeldPage>,
        curr: &HeldPage,
        sibling: &HeldPage,
        new_root: Option<&HeldPage>,
    ) -> QuillStoreResult<RowHolder> {
        let above = match (parent, new_root) {
            (Some(parent), None) => parent,
            (None, Some(new_root)) => new_root,
            _ => {
                return Err(QuillStoreError::Internal(format!(
                    "split of page {} needs exactly one page above it",
                    curr.page_id()
                )))
            }
        };
        debug_assert!(curr.lock.mode() != Some(LockMode::Shared));

        let split_ratio = curr.page.row_count() / 2;
        let median = curr.page.split(&sibling.page, split_ratio)?;
        if new_root.is_some() {
            above.page.set_leaf(false);
            above.page.set_prev_page_id(curr.page_id());
        }
        above.page.insert_ordered(&median, self.index_position)?;
        if new_root.is_some() {
            self.root_page_id
                .store(above.page_id(), AtomicOrdering::Release);
            debug!(
                "root split, new root is page {} over {} and {}",
                above.page_id(),
                curr.page_id(),
                sibling.page_id()
            );
        }
        self.dump_page(&curr.page);
        self.dump_page(&sibling.page);
        self.dump_page(&above.page);
        Ok(median)
    }

    fn check_not_present(&self, page: &MixedPage, row: &RowHolder) -> QuillStoreResult<()> {
        let col = self.index_position;
        let found = match self.index_kind {
            IndexKind::Int => page.binary_search(row.get_field::<i32>(col), col)?,
            IndexKind::Double => page.binary_search(row.get_field::<f64>(col), col)?,
            IndexKind::PagePointer => page.binary_search(row.get_field::<PageId>(col), col)?,
        };
        match found {
            Some(_) => Err(QuillStoreError::KeyAlreadyExists),
            None => Ok(()),
        }
    }

    /// Child of an internal page whose key range holds `row`.
    fn find_child(&self, page: &MixedPage, row: &RowHolder) -> QuillStoreResult<PageId> {
        let col = self.index_position;
        let floor = match self.index_kind {
            IndexKind::Int => page.binary_search_floor(row.get_field::<i32>(col), col)?,
            IndexKind::Double => page.binary_search_floor(row.get_field::<f64>(col), col)?,
            IndexKind::PagePointer => {
                page.binary_search_floor(row.get_field::<PageId>(col), col)?
            }
        };
        let child_page_id = match floor {
            Some(pos) => page.get_field_at::<PageId>(pos, self.pointer_position)?,
            None => page.prev_page_id(),
        };
        if child_page_id == NULL_PAGE_ID {
            return Err(QuillStoreError::Internal(format!(
                "internal page {} routes to a null child",
                page.page_id()
            )));
        }
        Ok(child_page_id)
    }

    fn check_key_type<K: FixedField>(&self) -> QuillStoreResult<()> {
        if K::COLUMN_TYPE != self.index_kind.column_type() {
            return Err(QuillStoreError::InvalidArgument(format!(
                "key of type {} used on {} index",
                K::COLUMN_TYPE,
                self.index_kind.column_type()
            )));
        }
        Ok(())
    }

    /// The row whose index column equals `key`, without the pointer column.
    pub async fn seek<K: FixedField>(
        &self,
        key: K,
        tran: &dyn Transaction,
    ) -> QuillStoreResult<RowHolder> {
        self.check_key_type::<K>()?;
        let col = self.index_position;
        let mut curr = self.lock_root(LockMode::Shared, tran).await?;
        loop {
            debug_assert!(tran.verify_lock(curr.page_id(), LockMode::Shared));
            let next_page_id = match curr.page.binary_search_floor(key, col)? {
                Some(pos) => {
                    if curr.page.get_field_at::<K>(pos, col)?.compare(&key).is_eq() {
                        return curr.page.row_at(pos)?.project(&self.remove_pointer);
                    }
                    curr.page.get_field_at::<PageId>(pos, self.pointer_position)?
                }
                None => curr.page.prev_page_id(),
            };
            if curr.page.is_leaf() || next_page_id == NULL_PAGE_ID {
                return Err(QuillStoreError::KeyNotFound);
            }
            curr = self.lock_page(next_page_id, LockMode::Shared, tran).await?;
        }
    }

    /// In-order cursor over every row.
    pub fn iterate<'a>(&'a self, tran: &'a dyn Transaction) -> BTreeCursor<'a> {
        BTreeCursor::new(self, tran)
    }

    /// Whether a full scan sees the index column strictly increasing.
    pub async fn validate<K: FixedField>(&self, tran: &dyn Transaction) -> QuillStoreResult<bool> {
        self.check_key_type::<K>()?;
        let mut cursor = self.iterate(tran);
        let mut last: Option<K> = None;
        while let Some(row) = cursor.next().await? {
            let key = row.get_field::<K>(self.index_position);
            if let Some(last) = last {
                if last.compare(&key).is_ge() {
                    return Ok(false);
                }
            }
            last = Some(key);
        }
        Ok(true)
    }

    fn dump_page(&self, page: &MixedPage) {
        if !self.config.debug_page_dump {
            return;
        }
        match pretty_format_page(page) {
            Ok(table) => trace!("page {}\n{table}", page.page_id()),
            Err(e) => warn!("failed to render page {}: {e}", page.page_id()),
        }
    }
}

impl PageCollection for BTreeCollection {
    fn column_types(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn supports_seek(&self) -> bool {
        true
    }

    async fn count(&self, _tran: &dyn Transaction) -> QuillStoreResult<u64> {
        Err(QuillStoreError::NotImplemented(
            "count on b+tree".to_string(),
        ))
    }

    async fn is_empty(&self, _tran: &dyn Transaction) -> QuillStoreResult<bool> {
        Err(QuillStoreError::NotImplemented(
            "is_empty on b+tree".to_string(),
        ))
    }

    async fn add(&self, item: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()> {
        BTreeCollection::add(self, item, tran).await
    }

    fn iterate<'a>(
        &'a self,
        tran: &'a dyn Transaction,
    ) -> BoxStream<'a, QuillStoreResult<RowHolder>> {
        BTreeCollection::iterate(self, tran).into_stream()
    }

    fn where_rows<'a, F>(
        &'a self,
        _filter: F,
        _tran: &'a dyn Transaction,
    ) -> BoxStream<'a, QuillStoreResult<RowHolder>>
    where
        F: Fn(&RowHolder) -> bool + Send + 'a,
    {
        futures::stream::once(futures::future::ready(Err(
            QuillStoreError::NotImplemented("where on b+tree".to_string()),
        )))
        .boxed()
    }

    async fn max<U, P>(&self, _projector: P, _start_min: U, _tran: &dyn Transaction) -> QuillStoreResult<U>
    where
        U: PartialOrd + Send,
        P: Fn(&RowHolder) -> U + Send,
    {
        Err(QuillStoreError::NotImplemented("max on b+tree".to_string()))
    }

    async fn seek<K: FixedField>(&self, key: K, tran: &dyn Transaction) -> QuillStoreResult<RowHolder> {
        BTreeCollection::seek(self, key, tran).await
    }
}
