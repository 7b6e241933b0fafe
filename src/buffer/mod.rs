mod buffer_pool;
mod page;

pub use buffer_pool::{Arena, BufferPool, ChunkToken};
pub use page::{MixedPage, PageId, MIXED_PAGE_TYPE, NULL_PAGE_ID, PAGE_HEADER_SIZE};
