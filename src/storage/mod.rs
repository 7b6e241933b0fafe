pub mod codec;
pub mod page_list;
pub mod page_manager;
pub mod row;

pub use page_list::PageListCollection;
pub use page_manager::{MemoryPageManager, PageAllocator};
pub use row::{ExtendColumn, MappingType, ProjectExtendInfo, RowHolder};
