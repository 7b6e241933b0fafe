mod field;

pub use field::{FieldValue, FixedField};

/// Little-endian reads and writes at fixed offsets of a page or row buffer.
///
/// Offsets are trusted: an out-of-range offset panics on the slice index.
pub struct CommonCodec;

impl CommonCodec {
    pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&bytes[offset..offset + 2]);
        u16::from_le_bytes(buf)
    }

    pub fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}
