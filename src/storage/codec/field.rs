use std::cmp::Ordering;

use crate::buffer::PageId;
use crate::catalog::{ColumnType, PagePointerOffsetPair};

/// A fixed-width column value that can be read from and written to row bytes.
///
/// `read_le` and `write_le` only look at the first `SIZE` bytes of the slice and
/// panic when it is shorter.
pub trait FixedField: Copy + PartialOrd + std::fmt::Debug + Send + Sync + 'static {
    const SIZE: usize;
    const COLUMN_TYPE: ColumnType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, bytes: &mut [u8]);

    fn compare(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

macro_rules! impl_fixed_field {
    ($ty:ty, $size:expr, $column_type:expr) => {
        impl FixedField for $ty {
            const SIZE: usize = $size;
            const COLUMN_TYPE: ColumnType = $column_type;

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                <$ty>::from_le_bytes(buf)
            }

            fn write_le(self, bytes: &mut [u8]) {
                bytes[..$size].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_fixed_field!(i32, 4, ColumnType::Int);
impl_fixed_field!(PageId, 8, ColumnType::PagePointer);

impl FixedField for f64 {
    const SIZE: usize = 8;
    const COLUMN_TYPE: ColumnType = ColumnType::Double;

    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }

    fn write_le(self, bytes: &mut [u8]) {
        bytes[..8].copy_from_slice(&self.to_le_bytes());
    }

    /// `-0.0` and `0.0` are the same key. NaN equals NaN and sorts below every number.
    fn compare(&self, other: &Self) -> Ordering {
        match self.partial_cmp(other) {
            Some(ordering) => ordering,
            None => self.is_nan().cmp(&other.is_nan()).reverse(),
        }
    }
}

impl FixedField for PagePointerOffsetPair {
    const SIZE: usize = PagePointerOffsetPair::SIZE;
    const COLUMN_TYPE: ColumnType = ColumnType::StringPointer;

    fn read_le(bytes: &[u8]) -> Self {
        let offset_in_page = i32::read_le(bytes);
        let page_id = PageId::read_le(&bytes[4..]);
        PagePointerOffsetPair::new(offset_in_page, page_id)
    }

    fn write_le(self, bytes: &mut [u8]) {
        self.offset_in_page.write_le(bytes);
        self.page_id.write_le(&mut bytes[4..]);
    }
}

/// Owned value of any column kind, used for extension defaults and display.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Double(f64),
    PagePointer(PageId),
    StringPointer(PagePointerOffsetPair),
    String(String),
}

impl FieldValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Int(_) => ColumnType::Int,
            FieldValue::Double(_) => ColumnType::Double,
            FieldValue::PagePointer(_) => ColumnType::PagePointer,
            FieldValue::StringPointer(_) => ColumnType::StringPointer,
            FieldValue::String(_) => ColumnType::String,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::PagePointer(v) => write!(f, "page#{v}"),
            FieldValue::StringPointer(v) => write!(f, "page#{}+{}", v.page_id, v.offset_in_page),
            FieldValue::String(v) => write!(f, "{v}"),
        }
    }
}
