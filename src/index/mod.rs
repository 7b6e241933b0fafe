use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::buffer::{MixedPage, NULL_PAGE_ID};
use crate::catalog::ColumnInfo;
use crate::error::QuillStoreResult;
use crate::storage::codec::FixedField;
use crate::storage::{PageAllocator, RowHolder};
use crate::transaction::Transaction;

pub mod btree_index;
pub mod btree_iterator;

pub use btree_index::{BTreeCollection, RowComparator};
pub use btree_iterator::BTreeCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CollectionType {
    PageList,
    BTree,
}

/// Allocates the first page of a collection. B+Tree pages carry an extra
/// trailing page pointer column.
pub async fn create_initial_page(
    collection_type: CollectionType,
    columns: &[ColumnInfo],
    allocator: &dyn PageAllocator,
    tran: &dyn Transaction,
) -> QuillStoreResult<Arc<MixedPage>> {
    match collection_type {
        CollectionType::PageList => {
            allocator
                .allocate_mixed_page(columns, NULL_PAGE_ID, NULL_PAGE_ID, tran)
                .await
        }
        CollectionType::BTree => {
            let mut btree_columns = columns.to_vec();
            btree_columns.push(ColumnInfo::page_pointer());
            allocator
                .allocate_mixed_page(&btree_columns, NULL_PAGE_ID, NULL_PAGE_ID, tran)
                .await
        }
    }
}

/// Row collection stored in pages.
#[allow(async_fn_in_trait)]
pub trait PageCollection {
    fn column_types(&self) -> &[ColumnInfo];

    fn supports_seek(&self) -> bool;

    async fn count(&self, tran: &dyn Transaction) -> QuillStoreResult<u64>;

    async fn is_empty(&self, tran: &dyn Transaction) -> QuillStoreResult<bool>;

    async fn add(&self, item: &RowHolder, tran: &dyn Transaction) -> QuillStoreResult<()>;

    fn iterate<'a>(&'a self, tran: &'a dyn Transaction)
        -> BoxStream<'a, QuillStoreResult<RowHolder>>;

    fn where_rows<'a, F>(
        &'a self,
        filter: F,
        tran: &'a dyn Transaction,
    ) -> BoxStream<'a, QuillStoreResult<RowHolder>>
    where
        F: Fn(&RowHolder) -> bool + Send + 'a,
    {
        self.iterate(tran)
            .try_filter(move |row| futures::future::ready(filter(row)))
            .boxed()
    }

    async fn max<U, P>(&self, projector: P, start_min: U, tran: &dyn Transaction) -> QuillStoreResult<U>
    where
        U: PartialOrd + Send,
        P: Fn(&RowHolder) -> U + Send;

    async fn seek<K: FixedField>(&self, key: K, tran: &dyn Transaction) -> QuillStoreResult<RowHolder>;
}
