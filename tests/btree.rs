use std::sync::Arc;

use futures::TryStreamExt;
use rand::seq::SliceRandom;

use quill_store::buffer::PageId;
use quill_store::catalog::{ColumnInfo, RowLayout};
use quill_store::config::{BTreeConfig, BufferPoolConfig};
use quill_store::error::QuillStoreError;
use quill_store::index::{BTreeCollection, PageCollection};
use quill_store::storage::{MemoryPageManager, PageAllocator, RowHolder};
use quill_store::transaction::{NotLoggedTransaction, Transaction};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn columns() -> Vec<ColumnInfo> {
    vec![ColumnInfo::int(), ColumnInfo::int()]
}

fn row(key: i32) -> RowHolder {
    let mut row = RowHolder::new(&RowLayout::try_new(&columns()).unwrap());
    row.set_field::<i32>(0, key);
    row.set_field::<i32>(1, key * 10);
    row
}

fn page_manager(page_size: usize, eviction_limit: usize) -> Arc<MemoryPageManager> {
    Arc::new(MemoryPageManager::new(
        BufferPoolConfig::default()
            .with_page_size(page_size)
            .with_eviction_limit(eviction_limit)
            .with_evict_batch(4usize),
    ))
}

async fn new_tree(allocator: Arc<dyn PageAllocator>, tran: &dyn Transaction) -> BTreeCollection {
    BTreeCollection::new(
        allocator,
        &columns(),
        BTreeCollection::column_comparator::<i32>(0),
        0,
        tran,
    )
    .await
    .unwrap()
}

async fn collect_keys(tree: &BTreeCollection, tran: &dyn Transaction) -> Vec<i32> {
    tree.iterate(tran)
        .into_stream()
        .map_ok(|r| r.get_field::<i32>(0))
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
}

#[tokio::test]
async fn five_rows_per_page_scenario() {
    init_logger();
    let tran = NotLoggedTransaction;
    // (120 - 36) / 16 = 5 node rows per page.
    let tree = new_tree(page_manager(120, 64), &tran).await;
    assert_eq!(tree.max_elements_per_page(), 5);

    for key in [5, 3, 8, 1, 4, 7, 2, 6, 9, 10, 11] {
        tree.add(&row(key), &tran).await.unwrap();
    }

    assert_eq!(collect_keys(&tree, &tran).await, (1..=11).collect::<Vec<_>>());
    assert!(tree.validate::<i32>(&tran).await.unwrap());

    let found = tree.seek(7i32, &tran).await.unwrap();
    assert_eq!(found.get_field::<i32>(0), 7);
    assert_eq!(found.get_field::<i32>(1), 70);
    for key in 1..=11 {
        let found = tree.seek(key, &tran).await.unwrap();
        assert_eq!(found.get_field::<i32>(1), key * 10);
    }
    assert!(matches!(
        tree.seek(12i32, &tran).await,
        Err(QuillStoreError::KeyNotFound)
    ));
    assert!(matches!(
        tree.seek(0i32, &tran).await,
        Err(QuillStoreError::KeyNotFound)
    ));
}

#[tokio::test]
async fn first_split_partitions_keys() {
    let tran = NotLoggedTransaction;
    let manager = page_manager(120, 64);
    let tree = new_tree(manager.clone(), &tran).await;
    let node_columns = {
        let mut node = columns();
        node.push(ColumnInfo::page_pointer());
        node
    };

    for key in 1..=(tree.max_elements_per_page() as i32 + 1) {
        tree.add(&row(key), &tran).await.unwrap();
    }

    let root = manager
        .get_mixed_page(tree.root_page_id(), &tran, &node_columns)
        .await
        .unwrap();
    assert_eq!(root.row_count(), 1);
    let separator = root.get_field_at::<i32>(0, 0).unwrap();
    let right_page_id = root.get_field_at::<PageId>(0, 2).unwrap();

    let left = manager
        .get_mixed_page(root.prev_page_id(), &tran, &node_columns)
        .await
        .unwrap();
    let right = manager
        .get_mixed_page(right_page_id, &tran, &node_columns)
        .await
        .unwrap();
    let left_keys = left
        .fetch()
        .unwrap()
        .iter()
        .map(|r| r.get_field::<i32>(0))
        .collect::<Vec<_>>();
    let right_keys = right
        .fetch()
        .unwrap()
        .iter()
        .map(|r| r.get_field::<i32>(0))
        .collect::<Vec<_>>();

    assert!(left_keys.iter().all(|k| *k < separator));
    assert!(right_keys.iter().all(|k| *k > separator));
    assert_eq!(left_keys.len() + right_keys.len() + 1, 6);
}

#[tokio::test]
async fn shuffled_inserts_iterate_sorted() {
    init_logger();
    let tran = NotLoggedTransaction;
    let tree = new_tree(page_manager(120, 256), &tran).await;

    let mut keys = (0..500).collect::<Vec<i32>>();
    keys.shuffle(&mut rand::rng());
    for key in keys.iter() {
        tree.add(&row(*key), &tran).await.unwrap();
    }

    assert_eq!(collect_keys(&tree, &tran).await, (0..500).collect::<Vec<_>>());
    assert!(tree.validate::<i32>(&tran).await.unwrap());
    for key in keys.iter().take(100) {
        assert_eq!(tree.seek(*key, &tran).await.unwrap().get_field::<i32>(1), key * 10);
    }
    for key in [-1, 500, 1000] {
        assert!(matches!(
            tree.seek(key, &tran).await,
            Err(QuillStoreError::KeyNotFound)
        ));
    }
}

#[tokio::test]
async fn duplicate_insert_leaves_tree_unchanged() {
    let tran = NotLoggedTransaction;
    let tree = new_tree(page_manager(120, 64), &tran).await;
    for key in (0..60).rev() {
        tree.add(&row(key), &tran).await.unwrap();
    }
    let before = collect_keys(&tree, &tran).await;
    let root_before = tree.root_page_id();

    for key in (0..60).step_by(7) {
        assert!(matches!(
            tree.add(&row(key), &tran).await,
            Err(QuillStoreError::KeyAlreadyExists)
        ));
    }
    assert_eq!(collect_keys(&tree, &tran).await, before);
    assert_eq!(tree.root_page_id(), root_before);
}

#[tokio::test]
async fn tree_survives_eviction() {
    init_logger();
    let tran = NotLoggedTransaction;
    let manager = page_manager(120, 12);
    let tree = new_tree(manager.clone(), &tran).await;

    for key in 0..300 {
        tree.add(&row(key * 3), &tran).await.unwrap();
    }
    assert!(manager.persisted_page_count() > 0);
    assert!(manager.buffer_pool().pages_in_pool() <= 13);

    assert!(tree.validate::<i32>(&tran).await.unwrap());
    assert_eq!(collect_keys(&tree, &tran).await.len(), 300);
    assert_eq!(tree.seek(150i32, &tran).await.unwrap().get_field::<i32>(1), 1500);
    assert!(matches!(
        tree.seek(151i32, &tran).await,
        Err(QuillStoreError::KeyNotFound)
    ));
}

#[tokio::test]
async fn reopen_existing_tree() {
    let tran = NotLoggedTransaction;
    let manager = page_manager(120, 64);
    let tree = new_tree(manager.clone(), &tran).await;
    for key in 0..30 {
        tree.add(&row(key), &tran).await.unwrap();
    }

    let reopened = BTreeCollection::open(
        manager.clone(),
        &columns(),
        BTreeCollection::column_comparator::<i32>(0),
        0,
        tree.root_page_id(),
        &tran,
    )
    .await
    .unwrap();
    assert_eq!(reopened.seek(17i32, &tran).await.unwrap().get_field::<i32>(1), 170);
    reopened.add(&row(30), &tran).await.unwrap();
    assert_eq!(collect_keys(&reopened, &tran).await, (0..=30).collect::<Vec<_>>());

    assert!(matches!(
        BTreeCollection::open(
            manager,
            &columns(),
            BTreeCollection::column_comparator::<i32>(0),
            0,
            9999,
            &tran,
        )
        .await,
        Err(QuillStoreError::PageNotFound(9999))
    ));
}

#[tokio::test]
async fn trait_object_view_of_the_tree() {
    let tran = NotLoggedTransaction;
    let tree = BTreeCollection::new_with_config(
        page_manager(120, 64),
        &columns(),
        BTreeCollection::column_comparator::<i32>(0),
        0,
        BTreeConfig::default().with_debug_page_dump(true),
        &tran,
    )
    .await
    .unwrap();
    assert_eq!(tree.column_types(), columns().as_slice());

    for key in [3, 1, 2] {
        PageCollection::add(&tree, &row(key), &tran).await.unwrap();
    }
    let rows = PageCollection::iterate(&tree, &tran)
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].column_count(), 2);
    assert_eq!(
        PageCollection::seek(&tree, 2i32, &tran)
            .await
            .unwrap()
            .get_field::<i32>(1),
        20
    );
}

#[tokio::test]
async fn empty_tree() {
    let tran = NotLoggedTransaction;
    let tree = new_tree(page_manager(120, 64), &tran).await;
    assert!(collect_keys(&tree, &tran).await.is_empty());
    assert!(tree.validate::<i32>(&tran).await.unwrap());
    assert!(matches!(
        tree.seek(1i32, &tran).await,
        Err(QuillStoreError::KeyNotFound)
    ));

    let mut cursor = tree.iterate(&tran);
    assert!(cursor.next().await.unwrap().is_none());
    assert!(cursor.next().await.unwrap().is_none());
}
