use std::ops::Range;

use derive_new::new;

use crate::catalog::{ColumnInfo, ColumnType, PagePointerOffsetPair, RowLayout, STRING_LENGTH_PREFIX};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::storage::codec::{CommonCodec, FieldValue, FixedField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingType {
    Projection,
    Extension,
}

/// A column appended by `project_and_extend`. Without a default its bytes are zero.
#[derive(new, Debug, Clone, PartialEq)]
pub struct ExtendColumn {
    pub info: ColumnInfo,
    pub default: Option<FieldValue>,
}

/// Describes an output row column by column: either copied from a source position
/// or a freshly appended column.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectExtendInfo {
    mapping_types: Vec<MappingType>,
    project_source_positions: Vec<usize>,
    extend_columns: Vec<ExtendColumn>,
}

impl ProjectExtendInfo {
    pub fn try_new(
        mapping_types: Vec<MappingType>,
        project_source_positions: Vec<usize>,
        extend_columns: Vec<ExtendColumn>,
    ) -> QuillStoreResult<Self> {
        let projections = mapping_types
            .iter()
            .filter(|m| **m == MappingType::Projection)
            .count();
        if projections != project_source_positions.len()
            || mapping_types.len() != projections + extend_columns.len()
        {
            return Err(QuillStoreError::InvalidArgument(format!(
                "{} mapping types can't be covered by {} projections and {} extensions",
                mapping_types.len(),
                project_source_positions.len(),
                extend_columns.len()
            )));
        }
        for column in extend_columns.iter() {
            if let Some(default) = &column.default {
                if default.column_type() != column.info.column_type() {
                    return Err(QuillStoreError::InvalidArgument(format!(
                        "default {} doesn't match column {}",
                        default, column.info
                    )));
                }
            }
        }
        Ok(Self {
            mapping_types,
            project_source_positions,
            extend_columns,
        })
    }

    /// Keeps the given source columns in order.
    pub fn projection(positions: Vec<usize>) -> QuillStoreResult<Self> {
        Self::try_new(
            vec![MappingType::Projection; positions.len()],
            positions,
            vec![],
        )
    }

    /// Keeps the first `keep` source columns and appends `extensions` after them.
    pub fn append(keep: usize, extensions: Vec<ExtendColumn>) -> QuillStoreResult<Self> {
        let mut mapping_types = vec![MappingType::Projection; keep];
        mapping_types.extend(std::iter::repeat(MappingType::Extension).take(extensions.len()));
        Self::try_new(mapping_types, (0..keep).collect(), extensions)
    }

    pub fn mapping_types(&self) -> &[MappingType] {
        &self.mapping_types
    }
}

/// One row: contiguous bytes plus the starting offset of each column.
///
/// A column ends where the next one starts; the last column runs to the end of
/// the storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowHolder {
    storage: Vec<u8>,
    column_positions: Vec<u16>,
}

impl RowHolder {
    pub fn new(layout: &RowLayout) -> Self {
        Self {
            storage: vec![0u8; layout.row_size()],
            column_positions: layout.offsets().to_vec(),
        }
    }

    pub fn from_bytes(layout: &RowLayout, bytes: &[u8]) -> QuillStoreResult<Self> {
        if bytes.len() != layout.row_size() {
            return Err(QuillStoreError::InvalidArgument(format!(
                "row image of {} bytes doesn't match row size {}",
                bytes.len(),
                layout.row_size()
            )));
        }
        Ok(Self {
            storage: bytes.to_vec(),
            column_positions: layout.offsets().to_vec(),
        })
    }

    /// A row without columns.
    pub fn zero() -> Self {
        Self {
            storage: vec![],
            column_positions: vec![],
        }
    }

    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    pub fn column_count(&self) -> usize {
        self.column_positions.len()
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Overwrites the whole row image, keeping the column offsets.
    pub fn fill(&mut self, bytes: &[u8]) -> QuillStoreResult<()> {
        if bytes.len() != self.storage.len() {
            return Err(QuillStoreError::InvalidArgument(format!(
                "row image of {} bytes doesn't match row size {}",
                bytes.len(),
                self.storage.len()
            )));
        }
        self.storage.copy_from_slice(bytes);
        Ok(())
    }

    fn column_range(&self, col: usize) -> Range<usize> {
        let start = self.column_positions[col] as usize;
        let end = self
            .column_positions
            .get(col + 1)
            .map(|p| *p as usize)
            .unwrap_or(self.storage.len());
        start..end
    }

    /// # Panics
    /// If `col` is out of range or the column is narrower than `T`.
    pub fn get_field<T: FixedField>(&self, col: usize) -> T {
        let range = self.column_range(col);
        T::read_le(&self.storage[range])
    }

    /// # Panics
    /// If `col` is out of range or the column is narrower than `T`.
    pub fn set_field<T: FixedField>(&mut self, col: usize, value: T) {
        let range = self.column_range(col);
        value.write_le(&mut self.storage[range]);
    }

    pub fn get_string(&self, col: usize) -> QuillStoreResult<String> {
        let range = self.column_range(col);
        let slot = &self.storage[range];
        if slot.len() < STRING_LENGTH_PREFIX {
            return Err(QuillStoreError::Internal(format!(
                "column {col} is too narrow to hold a string"
            )));
        }
        let length = CommonCodec::read_u16(slot, 0) as usize;
        let bytes = slot
            .get(STRING_LENGTH_PREFIX..STRING_LENGTH_PREFIX + length)
            .ok_or_else(|| {
                QuillStoreError::Internal(format!(
                    "string length {length} overruns column {col} of {} bytes",
                    slot.len()
                ))
            })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| QuillStoreError::Internal(format!("column {col} is not utf8: {e}")))
    }

    /// Stores `value` with its length prefix. The bytes must fit inside the column.
    pub fn set_string(&mut self, col: usize, value: &str) -> QuillStoreResult<()> {
        let range = self.column_range(col);
        let bytes = value.as_bytes();
        if STRING_LENGTH_PREFIX + bytes.len() > range.len() {
            return Err(QuillStoreError::RowTooLarge(format!(
                "string of {} bytes doesn't fit column {col} of {} bytes",
                bytes.len(),
                range.len()
            )));
        }
        let slot = &mut self.storage[range];
        CommonCodec::write_u16(slot, 0, bytes.len() as u16);
        slot[STRING_LENGTH_PREFIX..STRING_LENGTH_PREFIX + bytes.len()].copy_from_slice(bytes);
        slot[STRING_LENGTH_PREFIX + bytes.len()..].fill(0);
        Ok(())
    }

    pub fn get_value(&self, col: usize, column_type: ColumnType) -> QuillStoreResult<FieldValue> {
        self.check_column(col)?;
        Ok(match column_type {
            ColumnType::Int => FieldValue::Int(self.get_field::<i32>(col)),
            ColumnType::Double => FieldValue::Double(self.get_field::<f64>(col)),
            ColumnType::PagePointer => FieldValue::PagePointer(self.get_field::<u64>(col)),
            ColumnType::StringPointer => {
                FieldValue::StringPointer(self.get_field::<PagePointerOffsetPair>(col))
            }
            ColumnType::String => FieldValue::String(self.get_string(col)?),
        })
    }

    pub fn set_value(&mut self, col: usize, value: &FieldValue) -> QuillStoreResult<()> {
        self.check_column(col)?;
        match value {
            FieldValue::Int(v) => self.set_field(col, *v),
            FieldValue::Double(v) => self.set_field(col, *v),
            FieldValue::PagePointer(v) => self.set_field(col, *v),
            FieldValue::StringPointer(v) => self.set_field(col, *v),
            FieldValue::String(v) => return self.set_string(col, v),
        }
        Ok(())
    }

    fn check_column(&self, col: usize) -> QuillStoreResult<()> {
        if col >= self.column_positions.len() {
            return Err(QuillStoreError::InvalidArgument(format!(
                "column {col} out of range, row has {} columns",
                self.column_positions.len()
            )));
        }
        Ok(())
    }

    /// New row made of the listed columns, in the listed order.
    pub fn project(&self, cols: &[usize]) -> QuillStoreResult<RowHolder> {
        let mut storage = Vec::new();
        let mut column_positions = Vec::with_capacity(cols.len());
        for col in cols {
            self.check_column(*col)?;
            column_positions.push(storage.len() as u16);
            storage.extend_from_slice(&self.storage[self.column_range(*col)]);
        }
        if storage.len() > u16::MAX as usize {
            return Err(QuillStoreError::RowTooLarge(format!(
                "projected row of {} bytes exceeds u16",
                storage.len()
            )));
        }
        Ok(RowHolder {
            storage,
            column_positions,
        })
    }

    pub fn project_and_extend(&self, info: &ProjectExtendInfo) -> QuillStoreResult<RowHolder> {
        let mut storage = Vec::new();
        let mut column_positions = Vec::with_capacity(info.mapping_types.len());
        let mut defaults = Vec::new();
        let mut projections = info.project_source_positions.iter();
        let mut extensions = info.extend_columns.iter();

        for (i, mapping) in info.mapping_types.iter().enumerate() {
            column_positions.push(storage.len() as u16);
            match mapping {
                MappingType::Projection => {
                    let col = *projections.next().ok_or_else(|| {
                        QuillStoreError::Internal("projection positions exhausted".to_string())
                    })?;
                    self.check_column(col)?;
                    storage.extend_from_slice(&self.storage[self.column_range(col)]);
                }
                MappingType::Extension => {
                    let column = extensions.next().ok_or_else(|| {
                        QuillStoreError::Internal("extension columns exhausted".to_string())
                    })?;
                    storage.resize(storage.len() + column.info.size(), 0);
                    if let Some(default) = &column.default {
                        defaults.push((i, default));
                    }
                }
            }
        }
        if storage.len() > u16::MAX as usize {
            return Err(QuillStoreError::RowTooLarge(format!(
                "extended row of {} bytes exceeds u16",
                storage.len()
            )));
        }

        let mut row = RowHolder {
            storage,
            column_positions,
        };
        for (col, default) in defaults {
            row.set_value(col, default)?;
        }
        Ok(row)
    }

    /// Concatenates `other` after `self`.
    pub fn merge(&self, other: &RowHolder) -> QuillStoreResult<RowHolder> {
        let shift = self.storage.len();
        if shift + other.storage.len() > u16::MAX as usize {
            return Err(QuillStoreError::RowTooLarge(format!(
                "merged row of {} bytes exceeds u16",
                shift + other.storage.len()
            )));
        }
        let mut storage = self.storage.clone();
        storage.extend_from_slice(&other.storage);
        let column_positions = self
            .column_positions
            .iter()
            .copied()
            .chain(other.column_positions.iter().map(|p| p + shift as u16))
            .collect();
        Ok(RowHolder {
            storage,
            column_positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RowLayout {
        RowLayout::try_new(&[
            ColumnInfo::int(),
            ColumnInfo::double(),
            ColumnInfo::string(8),
        ])
        .unwrap()
    }

    fn sample_row() -> RowHolder {
        let mut row = RowHolder::new(&layout());
        row.set_field::<i32>(0, 42);
        row.set_field::<f64>(1, 4.5);
        row.set_string(2, "quill").unwrap();
        row
    }

    #[test]
    fn fields_read_back() {
        let row = sample_row();
        assert_eq!(row.get_field::<i32>(0), 42);
        assert_eq!(row.get_field::<f64>(1), 4.5);
        assert_eq!(row.get_string(2).unwrap(), "quill");
        assert_eq!(row.size(), 4 + 8 + 10);
    }

    #[test]
    fn string_must_fit_the_column() {
        let mut row = sample_row();
        assert!(row.set_string(2, "12345678").is_ok());
        assert!(matches!(
            row.set_string(2, "123456789"),
            Err(QuillStoreError::RowTooLarge(_))
        ));
        assert_eq!(row.get_string(2).unwrap(), "12345678");

        row.set_string(2, "ab").unwrap();
        assert_eq!(row.get_string(2).unwrap(), "ab");
    }

    #[test]
    fn project_reorders_columns() {
        let row = sample_row();
        let projected = row.project(&[2, 0]).unwrap();
        assert_eq!(projected.column_count(), 2);
        assert_eq!(projected.get_string(0).unwrap(), "quill");
        assert_eq!(projected.get_field::<i32>(1), 42);
        assert!(row.project(&[3]).is_err());
    }

    #[test]
    fn project_complement_merge_is_lossless() {
        let row = sample_row();
        let left = row.project(&[0]).unwrap();
        let right = row.project(&[1, 2]).unwrap();
        assert_eq!(left.merge(&right).unwrap(), row);
    }

    #[test]
    fn extend_appends_pointer_with_default() {
        let row = sample_row();
        let info = ProjectExtendInfo::append(
            3,
            vec![ExtendColumn::new(
                ColumnInfo::page_pointer(),
                Some(FieldValue::PagePointer(77)),
            )],
        )
        .unwrap();
        let extended = row.project_and_extend(&info).unwrap();
        assert_eq!(extended.column_count(), 4);
        assert_eq!(extended.get_field::<u64>(3), 77);
        assert_eq!(extended.project(&[0, 1, 2]).unwrap(), row);
    }

    #[test]
    fn extend_without_default_is_zeroed() {
        let row = sample_row();
        let info = ProjectExtendInfo::try_new(
            vec![MappingType::Extension, MappingType::Projection],
            vec![0],
            vec![ExtendColumn::new(ColumnInfo::double(), None)],
        )
        .unwrap();
        let extended = row.project_and_extend(&info).unwrap();
        assert_eq!(extended.get_field::<f64>(0), 0.0);
        assert_eq!(extended.get_field::<i32>(1), 42);
    }

    #[test]
    fn mismatched_extend_info_rejected() {
        assert!(ProjectExtendInfo::try_new(vec![MappingType::Projection], vec![], vec![]).is_err());
        assert!(ProjectExtendInfo::try_new(
            vec![MappingType::Extension],
            vec![],
            vec![ExtendColumn::new(
                ColumnInfo::int(),
                Some(FieldValue::Double(1.0))
            )],
        )
        .is_err());
    }

    #[test]
    fn oversized_projection_rejected() {
        let layout = RowLayout::try_new(&[ColumnInfo::string(40000)]).unwrap();
        let mut row = RowHolder::new(&layout);
        row.set_string(0, "wide").unwrap();
        assert!(matches!(
            row.project(&[0, 0]),
            Err(QuillStoreError::RowTooLarge(_))
        ));
        assert_eq!(row.project(&[0]).unwrap(), row);
    }

    #[test]
    fn values_by_column_type() {
        let row = sample_row();
        assert_eq!(row.get_value(0, ColumnType::Int).unwrap(), FieldValue::Int(42));
        assert_eq!(
            row.get_value(2, ColumnType::String).unwrap(),
            FieldValue::String("quill".to_string())
        );
        assert!(row.get_value(5, ColumnType::Int).is_err());
    }
}
