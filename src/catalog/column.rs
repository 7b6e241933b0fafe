use derive_new::new;

use crate::buffer::PageId;

/// Size of the `u16` length prefix in front of inline string bytes.
pub const STRING_LENGTH_PREFIX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ColumnType {
    Int,
    Double,
    PagePointer,
    StringPointer,
    String,
}

/// A column kind plus, for inline strings, the max payload length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnInfo {
    column_type: ColumnType,
    max_length: u16,
}

impl ColumnInfo {
    pub fn int() -> Self {
        Self::fixed(ColumnType::Int)
    }

    pub fn double() -> Self {
        Self::fixed(ColumnType::Double)
    }

    pub fn page_pointer() -> Self {
        Self::fixed(ColumnType::PagePointer)
    }

    pub fn string_pointer() -> Self {
        Self::fixed(ColumnType::StringPointer)
    }

    pub fn string(max_length: u16) -> Self {
        Self {
            column_type: ColumnType::String,
            max_length,
        }
    }

    fn fixed(column_type: ColumnType) -> Self {
        Self {
            column_type,
            max_length: 0,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn max_length(&self) -> u16 {
        self.max_length
    }

    /// Bytes the column occupies inside a row.
    pub fn size(&self) -> usize {
        match self.column_type {
            ColumnType::Int => 4,
            ColumnType::Double => 8,
            ColumnType::PagePointer => 8,
            ColumnType::StringPointer => PagePointerOffsetPair::SIZE,
            ColumnType::String => STRING_LENGTH_PREFIX + self.max_length as usize,
        }
    }
}

impl std::fmt::Display for ColumnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.column_type {
            ColumnType::String => write!(f, "String({})", self.max_length),
            other => write!(f, "{other}"),
        }
    }
}

/// Location of an out-of-row string: the page and the byte offset inside it.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PagePointerOffsetPair {
    pub offset_in_page: i32,
    pub page_id: PageId,
}

impl PagePointerOffsetPair {
    pub const SIZE: usize = 4 + 8;
}
