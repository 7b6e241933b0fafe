use futures::stream::BoxStream;
use futures::StreamExt;

use crate::buffer::{PageId, NULL_PAGE_ID};
use crate::error::QuillStoreResult;
use crate::index::btree_index::{BTreeCollection, HeldPage};
use crate::storage::RowHolder;
use crate::transaction::{LockMode, Transaction};

enum Frame {
    Unvisited(PageId),
    Visiting { page: HeldPage, position: usize },
}

/// In-order walk over a tree with an explicit stack, one frame per level.
///
/// A page stays share-locked until its last row has been yielded. The cursor is
/// single pass; walking again needs a new cursor.
pub struct BTreeCursor<'a> {
    tree: &'a BTreeCollection,
    tran: &'a dyn Transaction,
    stack: Vec<Frame>,
    started: bool,
}

impl<'a> BTreeCursor<'a> {
    pub(crate) fn new(tree: &'a BTreeCollection, tran: &'a dyn Transaction) -> Self {
        Self {
            tree,
            tran,
            stack: vec![],
            started: false,
        }
    }

    /// Next row without the pointer column, or `None` once the walk is over.
    pub async fn next(&mut self) -> QuillStoreResult<Option<RowHolder>> {
        if !self.started {
            self.started = true;
            let root = self.tree.lock_root(LockMode::Shared, self.tran).await?;
            self.visit(root);
        }
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Unvisited(page_id) => {
                    let page = self
                        .tree
                        .lock_page(page_id, LockMode::Shared, self.tran)
                        .await?;
                    self.visit(page);
                }
                Frame::Visiting { page, position } => {
                    debug_assert!(self.tran.verify_lock(page.page_id(), LockMode::Shared));
                    let row = page.page.row_at(position)?;
                    let child_page_id = row.get_field::<PageId>(self.tree.pointer_position());
                    if position + 1 < page.page.row_count() {
                        self.stack.push(Frame::Visiting {
                            page,
                            position: position + 1,
                        });
                    }
                    if child_page_id != NULL_PAGE_ID {
                        self.stack.push(Frame::Unvisited(child_page_id));
                    }
                    return Ok(Some(row.project(self.tree.user_positions())?));
                }
            }
        }
        Ok(None)
    }

    fn visit(&mut self, page: HeldPage) {
        let left_page_id = page.page.prev_page_id();
        if page.page.row_count() > 0 {
            self.stack.push(Frame::Visiting { page, position: 0 });
        }
        if left_page_id != NULL_PAGE_ID {
            self.stack.push(Frame::Unvisited(left_page_id));
        }
    }

    pub fn into_stream(self) -> BoxStream<'a, QuillStoreResult<RowHolder>> {
        futures::stream::try_unfold(self, |cursor| next_row(cursor)).boxed()
    }
}

async fn next_row(
    mut cursor: BTreeCursor<'_>,
) -> QuillStoreResult<Option<(RowHolder, BTreeCursor<'_>)>> {
    let row = cursor.next().await?;
    Ok(row.map(|row| (row, cursor)))
}
