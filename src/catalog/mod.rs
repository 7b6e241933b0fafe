mod column;
mod schema;

pub use column::{ColumnInfo, ColumnType, PagePointerOffsetPair, STRING_LENGTH_PREFIX};
pub use schema::*;
