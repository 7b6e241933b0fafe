use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::buffer_pool::{Arena, ChunkToken};
use crate::catalog::{ColumnType, RowLayoutRef};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::storage::codec::{CommonCodec, FixedField};
use crate::storage::row::RowHolder;

pub type PageId = u64;

pub const NULL_PAGE_ID: PageId = 0;
pub const MIXED_PAGE_TYPE: u32 = 1;

// page_id(8) | page_size(4) | page_type(4) | row_count(4) | prev(8) | next(8)
const PAGE_ID_OFFSET: usize = 0;
const PAGE_SIZE_OFFSET: usize = 8;
const PAGE_TYPE_OFFSET: usize = 12;
const ROW_COUNT_OFFSET: usize = 16;
const PREV_PAGE_OFFSET: usize = 20;
const NEXT_PAGE_OFFSET: usize = 28;
pub const PAGE_HEADER_SIZE: usize = 36;

/// B+Tree pages keep their leaf flag in the lowest bit of next-page-id.
const LEAF_FLAG: PageId = 1;

/// A page of fixed-size rows living in one arena chunk.
///
/// Every accessor takes the chunk latch for the duration of the call. Holding a
/// transaction page lock is the caller's job.
pub struct MixedPage {
    page_id: PageId,
    token: ChunkToken,
    layout: RowLayoutRef,
    arena: Arc<Arena>,
    dirty: AtomicBool,
}

impl MixedPage {
    /// Writes a fresh header into the chunk. The page starts dirty and empty.
    pub fn format(
        arena: Arc<Arena>,
        token: ChunkToken,
        page_id: PageId,
        layout: RowLayoutRef,
        prev_page_id: PageId,
        next_page_id: PageId,
    ) -> QuillStoreResult<Self> {
        let page_size = arena.chunk_size();
        Self::check_fits(page_size, &layout)?;
        arena.write_chunk(token, |buf| {
            buf.fill(0);
            CommonCodec::write_u64(buf, PAGE_ID_OFFSET, page_id);
            CommonCodec::write_u32(buf, PAGE_SIZE_OFFSET, page_size as u32);
            CommonCodec::write_u32(buf, PAGE_TYPE_OFFSET, MIXED_PAGE_TYPE);
            CommonCodec::write_u32(buf, ROW_COUNT_OFFSET, 0);
            CommonCodec::write_u64(buf, PREV_PAGE_OFFSET, prev_page_id);
            CommonCodec::write_u64(buf, NEXT_PAGE_OFFSET, next_page_id);
        });
        Ok(Self {
            page_id,
            token,
            layout,
            arena,
            dirty: AtomicBool::new(true),
        })
    }

    /// Copies a persisted page image back into a chunk.
    pub fn load(
        arena: Arc<Arena>,
        token: ChunkToken,
        layout: RowLayoutRef,
        image: &[u8],
    ) -> QuillStoreResult<Self> {
        let page_size = arena.chunk_size();
        if image.len() != page_size {
            return Err(QuillStoreError::InvalidArgument(format!(
                "page image of {} bytes doesn't match page size {page_size}",
                image.len()
            )));
        }
        if CommonCodec::read_u32(image, PAGE_SIZE_OFFSET) as usize != page_size
            || CommonCodec::read_u32(image, PAGE_TYPE_OFFSET) != MIXED_PAGE_TYPE
        {
            return Err(QuillStoreError::Internal(
                "page image header is corrupted".to_string(),
            ));
        }
        Self::check_fits(page_size, &layout)?;
        let page_id = CommonCodec::read_u64(image, PAGE_ID_OFFSET);
        arena.write_chunk(token, |buf| buf.copy_from_slice(image));
        Ok(Self {
            page_id,
            token,
            layout,
            arena,
            dirty: AtomicBool::new(false),
        })
    }

    fn check_fits(page_size: usize, layout: &RowLayoutRef) -> QuillStoreResult<()> {
        if page_size < PAGE_HEADER_SIZE + layout.row_size() {
            return Err(QuillStoreError::RowTooLarge(format!(
                "row of {} bytes doesn't fit a page of {page_size} bytes",
                layout.row_size()
            )));
        }
        Ok(())
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn token(&self) -> ChunkToken {
        self.token
    }

    pub fn layout(&self) -> &RowLayoutRef {
        &self.layout
    }

    pub fn page_size(&self) -> usize {
        self.arena.chunk_size()
    }

    pub fn row_count(&self) -> usize {
        self.arena
            .read_chunk(self.token, |buf| CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize)
    }

    pub fn max_row_count(&self) -> usize {
        (self.page_size() - PAGE_HEADER_SIZE) / self.layout.row_size()
    }

    pub fn prev_page_id(&self) -> PageId {
        self.arena
            .read_chunk(self.token, |buf| CommonCodec::read_u64(buf, PREV_PAGE_OFFSET))
    }

    pub fn set_prev_page_id(&self, page_id: PageId) {
        self.write(|buf| CommonCodec::write_u64(buf, PREV_PAGE_OFFSET, page_id));
    }

    pub fn next_page_id(&self) -> PageId {
        self.arena
            .read_chunk(self.token, |buf| CommonCodec::read_u64(buf, NEXT_PAGE_OFFSET))
    }

    pub fn set_next_page_id(&self, page_id: PageId) {
        self.write(|buf| CommonCodec::write_u64(buf, NEXT_PAGE_OFFSET, page_id));
    }

    pub fn is_leaf(&self) -> bool {
        self.next_page_id() & LEAF_FLAG == LEAF_FLAG
    }

    pub fn set_leaf(&self, leaf: bool) {
        self.write(|buf| {
            let next = CommonCodec::read_u64(buf, NEXT_PAGE_OFFSET);
            let next = if leaf { next | LEAF_FLAG } else { next & !LEAF_FLAG };
            CommonCodec::write_u64(buf, NEXT_PAGE_OFFSET, next);
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn can_fit(&self, row: &RowHolder) -> bool {
        row.size() == self.layout.row_size() && self.row_count() < self.max_row_count()
    }

    /// Appends `row` after the last row.
    pub fn insert(&self, row: &RowHolder) -> QuillStoreResult<usize> {
        self.check_row(row)?;
        let max_rows = self.max_row_count();
        let row_size = self.layout.row_size();
        self.try_write(|buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            if count >= max_rows {
                return Err(QuillStoreError::PageFull(self.page_id));
            }
            let start = row_offset(count, row_size);
            buf[start..start + row_size].copy_from_slice(row.storage());
            CommonCodec::write_u32(buf, ROW_COUNT_OFFSET, (count + 1) as u32);
            Ok(count)
        })
    }

    /// Inserts `row` keeping rows sorted ascending on column `col`. Equal keys
    /// land after the existing ones.
    pub fn insert_ordered(&self, row: &RowHolder, col: usize) -> QuillStoreResult<usize> {
        match self.layout.column_type(col)? {
            ColumnType::Int => self.insert_ordered_by::<i32>(row, col),
            ColumnType::Double => self.insert_ordered_by::<f64>(row, col),
            ColumnType::PagePointer => self.insert_ordered_by::<PageId>(row, col),
            other => Err(QuillStoreError::NotImplemented(format!(
                "ordered insert on {other} column"
            ))),
        }
    }

    fn insert_ordered_by<T: FixedField>(&self, row: &RowHolder, col: usize) -> QuillStoreResult<usize> {
        self.check_row(row)?;
        let key = row.get_field::<T>(col);
        let max_rows = self.max_row_count();
        let row_size = self.layout.row_size();
        self.try_write(|buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            if count >= max_rows {
                return Err(QuillStoreError::PageFull(self.page_id));
            }
            let pos = self.partition_point::<T>(buf, count, col, |v| v.compare(&key).is_le());
            let start = row_offset(pos, row_size);
            let end = row_offset(count, row_size);
            buf.copy_within(start..end, start + row_size);
            buf[start..start + row_size].copy_from_slice(row.storage());
            CommonCodec::write_u32(buf, ROW_COUNT_OFFSET, (count + 1) as u32);
            Ok(pos)
        })
    }

    pub fn row_at(&self, pos: usize) -> QuillStoreResult<RowHolder> {
        let row_size = self.layout.row_size();
        let image = self.arena.read_chunk(self.token, |buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            if pos >= count {
                return Err(self.row_out_of_range(pos, count));
            }
            let start = row_offset(pos, row_size);
            Ok(buf[start..start + row_size].to_vec())
        })?;
        RowHolder::from_bytes(&self.layout, &image)
    }

    /// Copies every row out of the page in page order.
    pub fn fetch(&self) -> QuillStoreResult<Vec<RowHolder>> {
        let row_size = self.layout.row_size();
        let images = self.arena.read_chunk(self.token, |buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            (0..count)
                .map(|pos| {
                    let start = row_offset(pos, row_size);
                    buf[start..start + row_size].to_vec()
                })
                .collect::<Vec<_>>()
        });
        images
            .iter()
            .map(|image| RowHolder::from_bytes(&self.layout, image))
            .collect()
    }

    pub fn get_field_at<T: FixedField>(&self, pos: usize, col: usize) -> QuillStoreResult<T> {
        self.check_field_type::<T>(col)?;
        self.arena.read_chunk(self.token, |buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            if pos >= count {
                return Err(self.row_out_of_range(pos, count));
            }
            Ok(self.field_in::<T>(buf, pos, col))
        })
    }

    /// Position of a row whose column `col` equals `value`.
    pub fn binary_search<T: FixedField>(&self, value: T, col: usize) -> QuillStoreResult<Option<usize>> {
        self.check_field_type::<T>(col)?;
        Ok(self.arena.read_chunk(self.token, |buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            let pos = self.partition_point::<T>(buf, count, col, |v| v.compare(&value).is_lt());
            (pos < count && self.field_in::<T>(buf, pos, col).compare(&value).is_eq()).then_some(pos)
        }))
    }

    /// Position of the last row whose column `col` is `<= value`.
    pub fn binary_search_floor<T: FixedField>(
        &self,
        value: T,
        col: usize,
    ) -> QuillStoreResult<Option<usize>> {
        self.check_field_type::<T>(col)?;
        Ok(self.arena.read_chunk(self.token, |buf| {
            let count = CommonCodec::read_u32(buf, ROW_COUNT_OFFSET) as usize;
            let pos = self.partition_point::<T>(buf, count, col, |v| v.compare(&value).is_le());
            pos.checked_sub(1)
        }))
    }

    /// Moves the rows after `split_ratio` into the empty `new_page` and returns the
    /// row at `split_ratio`, which leaves both pages.
    ///
    /// The returned separator points at `new_page` through its trailing page
    /// pointer column. `new_page` takes the separator's old child pointer as its
    /// prev-page-id and inherits this page's leaf flag.
    pub fn split(&self, new_page: &MixedPage, split_ratio: usize) -> QuillStoreResult<RowHolder> {
        if self.layout != new_page.layout {
            return Err(QuillStoreError::InvalidArgument(
                "split target has a different row layout".to_string(),
            ));
        }
        let pointer_col = self.layout.column_count() - 1;
        if self.layout.column_type(pointer_col)? != ColumnType::PagePointer {
            return Err(QuillStoreError::InvalidArgument(
                "split needs a trailing page pointer column".to_string(),
            ));
        }
        let row_size = self.layout.row_size();
        let pointer_offset = self.layout.offsets()[pointer_col] as usize;

        let median = self
            .arena
            .write_two_chunks(self.token, new_page.token, |src, dst| {
                let count = CommonCodec::read_u32(src, ROW_COUNT_OFFSET) as usize;
                if split_ratio == 0 || split_ratio >= count {
                    return Err(QuillStoreError::InvalidArgument(format!(
                        "split ratio {split_ratio} invalid for {count} rows"
                    )));
                }
                if CommonCodec::read_u32(dst, ROW_COUNT_OFFSET) != 0 {
                    return Err(QuillStoreError::InvalidArgument(
                        "split target is not empty".to_string(),
                    ));
                }

                let median_start = row_offset(split_ratio, row_size);
                let mut median = src[median_start..median_start + row_size].to_vec();
                let old_child = CommonCodec::read_u64(&median, pointer_offset);
                CommonCodec::write_u64(&mut median, pointer_offset, new_page.page_id);

                let moved_start = row_offset(split_ratio + 1, row_size);
                let moved_end = row_offset(count, row_size);
                let moved = moved_end - moved_start;
                dst[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + moved]
                    .copy_from_slice(&src[moved_start..moved_end]);
                src[median_start..moved_end].fill(0);

                CommonCodec::write_u32(src, ROW_COUNT_OFFSET, split_ratio as u32);
                CommonCodec::write_u32(dst, ROW_COUNT_OFFSET, (count - split_ratio - 1) as u32);
                CommonCodec::write_u64(dst, PREV_PAGE_OFFSET, old_child);
                let src_next = CommonCodec::read_u64(src, NEXT_PAGE_OFFSET);
                let dst_next = CommonCodec::read_u64(dst, NEXT_PAGE_OFFSET);
                CommonCodec::write_u64(
                    dst,
                    NEXT_PAGE_OFFSET,
                    (dst_next & !LEAF_FLAG) | (src_next & LEAF_FLAG),
                );
                Ok(median)
            })?;
        self.dirty.store(true, Ordering::Release);
        new_page.dirty.store(true, Ordering::Release);
        RowHolder::from_bytes(&self.layout, &median)
    }

    /// Snapshot of the page bytes. Clears the dirty flag.
    pub fn persist(&self) -> Bytes {
        self.arena.read_chunk(self.token, |buf| {
            self.dirty.store(false, Ordering::Release);
            Bytes::copy_from_slice(buf)
        })
    }

    fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.arena.write_chunk(self.token, |buf| {
            let result = f(buf);
            self.dirty.store(true, Ordering::Release);
            result
        })
    }

    fn try_write<R>(&self, f: impl FnOnce(&mut [u8]) -> QuillStoreResult<R>) -> QuillStoreResult<R> {
        self.arena.write_chunk(self.token, |buf| {
            let result = f(buf)?;
            self.dirty.store(true, Ordering::Release);
            Ok(result)
        })
    }

    fn check_row(&self, row: &RowHolder) -> QuillStoreResult<()> {
        if row.size() != self.layout.row_size() {
            return Err(QuillStoreError::InvalidArgument(format!(
                "row of {} bytes doesn't match page row size {}",
                row.size(),
                self.layout.row_size()
            )));
        }
        Ok(())
    }

    fn check_field_type<T: FixedField>(&self, col: usize) -> QuillStoreResult<()> {
        let column_type = self.layout.column_type(col)?;
        if column_type != T::COLUMN_TYPE {
            return Err(QuillStoreError::InvalidArgument(format!(
                "column {col} is {column_type}, not {}",
                T::COLUMN_TYPE
            )));
        }
        Ok(())
    }

    fn row_out_of_range(&self, pos: usize, count: usize) -> QuillStoreError {
        QuillStoreError::InvalidArgument(format!(
            "row {pos} out of range, page {} has {count} rows",
            self.page_id
        ))
    }

    fn field_in<T: FixedField>(&self, buf: &[u8], pos: usize, col: usize) -> T {
        let start = row_offset(pos, self.layout.row_size()) + self.layout.offsets()[col] as usize;
        T::read_le(&buf[start..])
    }

    /// First position in `0..count` where `pred` stops holding.
    fn partition_point<T: FixedField>(
        &self,
        buf: &[u8],
        count: usize,
        col: usize,
        pred: impl Fn(&T) -> bool,
    ) -> usize {
        let (mut low, mut high) = (0usize, count);
        while low < high {
            let mid = low + (high - low) / 2;
            if pred(&self.field_in::<T>(buf, mid, col)) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }
}

fn row_offset(pos: usize, row_size: usize) -> usize {
    PAGE_HEADER_SIZE + pos * row_size
}

impl std::fmt::Debug for MixedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixedPage")
            .field("page_id", &self.page_id)
            .field("token", &self.token)
            .field("layout", &self.layout.to_string())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
