use std::sync::Arc;

use crate::catalog::{ColumnInfo, ColumnType};
use crate::error::{QuillStoreError, QuillStoreResult};

pub type RowLayoutRef = Arc<RowLayout>;

/// Ordered column list with the byte offset of every column in a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    columns: Vec<ColumnInfo>,
    offsets: Vec<u16>,
    row_size: usize,
}

impl RowLayout {
    pub fn try_new(columns: &[ColumnInfo]) -> QuillStoreResult<Self> {
        if columns.is_empty() {
            return Err(QuillStoreError::InvalidArgument(
                "row layout needs at least one column".to_string(),
            ));
        }
        let mut offsets = Vec::with_capacity(columns.len());
        let mut row_size = 0usize;
        for column in columns {
            let offset = u16::try_from(row_size).map_err(|_| {
                QuillStoreError::RowTooLarge(format!("column offset {row_size} exceeds u16"))
            })?;
            offsets.push(offset);
            row_size += column.size();
        }
        if row_size > u16::MAX as usize {
            return Err(QuillStoreError::RowTooLarge(format!(
                "row size {row_size} exceeds u16"
            )));
        }
        Ok(Self {
            columns: columns.to_vec(),
            offsets,
            row_size,
        })
    }

    /// Layout of a B+Tree node row: the user columns followed by a child page pointer.
    pub fn with_page_pointer(&self) -> QuillStoreResult<Self> {
        let mut columns = self.columns.clone();
        columns.push(ColumnInfo::page_pointer());
        Self::try_new(&columns)
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn offsets(&self) -> &[u16] {
        &self.offsets
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn column_with_index(&self, index: usize) -> QuillStoreResult<ColumnInfo> {
        self.columns.get(index).copied().ok_or_else(|| {
            QuillStoreError::InvalidArgument(format!(
                "column index {index} out of range, layout has {} columns",
                self.columns.len()
            ))
        })
    }

    pub fn column_type(&self, index: usize) -> QuillStoreResult<ColumnType> {
        Ok(self.column_with_index(index)?.column_type())
    }
}

impl std::fmt::Display for RowLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let columns = self
            .columns
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{columns}]")
    }
}
