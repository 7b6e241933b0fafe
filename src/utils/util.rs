use std::collections::VecDeque;

use comfy_table::Cell;

use crate::buffer::{MixedPage, PageId, NULL_PAGE_ID};
use crate::catalog::RowLayout;
use crate::error::QuillStoreResult;
use crate::index::BTreeCollection;
use crate::storage::RowHolder;
use crate::transaction::{LockMode, Transaction};

const TABLE_PRESET: &str = "||--+-++|    ++++++";

pub fn pretty_format_rows(layout: &RowLayout, rows: &[RowHolder]) -> QuillStoreResult<comfy_table::Table> {
    let mut table = comfy_table::Table::new();
    table.load_preset(TABLE_PRESET);

    let header = layout
        .columns()
        .iter()
        .map(|column| Cell::new(column.to_string()))
        .collect::<Vec<_>>();
    table.set_header(header);

    for row in rows {
        let mut cells = Vec::with_capacity(layout.column_count());
        for (col, column) in layout.columns().iter().enumerate() {
            cells.push(Cell::new(row.get_value(col, column.column_type())?));
        }
        table.add_row(cells);
    }
    Ok(table)
}

pub fn pretty_format_page(page: &MixedPage) -> QuillStoreResult<comfy_table::Table> {
    let rows = page.fetch()?;
    let mut table = comfy_table::Table::new();
    table.load_preset(TABLE_PRESET);
    table.set_header(vec![Cell::new(format!(
        "page_id={}, rows: {}/{}, prev={}, next={}",
        page.page_id(),
        page.row_count(),
        page.max_row_count(),
        page.prev_page_id(),
        page.next_page_id()
    ))]);
    table.add_row(vec![Cell::new(pretty_format_rows(page.layout(), &rows)?)]);
    Ok(table)
}

/// Renders the tree level by level. Every page is read under a shared lock.
pub async fn pretty_format_index_tree(
    tree: &BTreeCollection,
    tran: &dyn Transaction,
) -> QuillStoreResult<String> {
    let mut display = String::new();

    let mut curr_queue: VecDeque<PageId> = VecDeque::new();
    curr_queue.push_back(tree.root_page_id());

    let mut level_index = 1;
    while !curr_queue.is_empty() {
        let mut next_queue = VecDeque::new();
        display.push_str(&format!("B+ Tree Level No.{}:\n", level_index));

        let mut level_table = comfy_table::Table::new();
        level_table.load_preset(TABLE_PRESET);
        let mut level_header = vec![];
        let mut level_row = vec![];

        while let Some(page_id) = curr_queue.pop_front() {
            let held = tree.lock_page(page_id, LockMode::Shared, tran).await?;
            let page = &held.page;
            let rows = page.fetch()?;

            let mut page_table = comfy_table::Table::new();
            page_table.load_preset(TABLE_PRESET);
            let mut page_header = vec![];
            let mut page_row = vec![];
            for row in rows.iter() {
                let user_row = row.project(tree.user_positions())?;
                let values = tree
                    .btree_columns()
                    .iter()
                    .enumerate()
                    .take(user_row.column_count())
                    .map(|(col, column)| {
                        user_row
                            .get_value(col, column.column_type())
                            .map(|v| v.to_string())
                    })
                    .collect::<QuillStoreResult<Vec<_>>>()?;
                page_header.push(Cell::new(values.join(", ")));
                page_row.push(Cell::new(row.get_field::<PageId>(tree.pointer_position())));
            }
            page_table.set_header(page_header);
            page_table.add_row(page_row);

            if page.is_leaf() {
                level_header.push(Cell::new(format!(
                    "page_id={}, size: {}/{}, leaf",
                    page_id,
                    page.row_count(),
                    tree.max_elements_per_page()
                )));
            } else {
                level_header.push(Cell::new(format!(
                    "page_id={}, size: {}/{}, prev={}",
                    page_id,
                    page.row_count(),
                    tree.max_elements_per_page(),
                    page.prev_page_id()
                )));
                if page.prev_page_id() != NULL_PAGE_ID {
                    next_queue.push_back(page.prev_page_id());
                }
                next_queue.extend(
                    rows.iter()
                        .map(|row| row.get_field::<PageId>(tree.pointer_position()))
                        .filter(|child| *child != NULL_PAGE_ID),
                );
            }
            level_row.push(Cell::new(page_table));
        }
        level_table.set_header(level_header);
        level_table.add_row(level_row);
        display.push_str(&format!("{level_table}\n"));

        level_index += 1;
        curr_queue = next_queue;
    }
    Ok(display)
}
