use thiserror::Error;

use crate::buffer::PageId;

pub type QuillStoreResult<T, E = QuillStoreError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum QuillStoreError {
    #[error("Key already exists")]
    KeyAlreadyExists,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Row too large: {0}")]
    RowTooLarge(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Page {0} is full")]
    PageFull(PageId),

    #[error("Buffer pool exhausted: no free chunk and no evictable page")]
    BufferPoolExhausted,

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Transaction closed: {0}")]
    TransactionClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
