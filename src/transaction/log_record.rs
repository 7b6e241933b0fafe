use derive_new::new;

use crate::buffer::PageId;
use crate::catalog::ColumnInfo;
use crate::transaction::TransactionId;

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    AllocatePage(AllocatePageRecord),
}

impl LogRecord {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            LogRecord::AllocatePage(record) => record.tran_id,
        }
    }
}

#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct AllocatePageRecord {
    pub page_id: PageId,
    pub tran_id: TransactionId,
    pub page_size: u32,
    pub prev_page_id: PageId,
    pub next_page_id: PageId,
    pub columns: Vec<ColumnInfo>,
}
