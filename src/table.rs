//! Random access over a memory-mapped offset table.
//!
//! Every file written by this crate has the same overall shape:
//!
//! ```text
//! [Header]            // format specific, parsed by the caller
//! [Offsets Table]     // `entries` little-endian integers of `offset_width` bytes
//! [Padding]           // up to `payload_align`
//! [Payload]           // addressed by byte offsets relative to its start
//! ```
//!
//! `OffsetTable` owns the mapping, validates the table against the file
//! size once at open, and then serves width-aware reads without allocating.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Position and widths of the offsets table, as declared by a file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Byte offset of the first table entry.
    pub table_offset: u64,
    /// Number of table entries.
    pub entries: u64,
    /// Width of one table entry in bytes.
    pub offset_width: u8,
    /// Width of one payload value in bytes (used by `read_value`).
    pub value_width: u8,
    /// Alignment of the payload start.
    pub payload_align: u64,
}

impl TableLayout {
    /// Byte offset where the payload begins.
    pub fn payload_offset(&self) -> Option<u64> {
        let table_len = self.entries.checked_mul(self.offset_width as u64)?;
        let end = self.table_offset.checked_add(table_len)?;
        align_up(end, self.payload_align)
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(value);
    }
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

fn valid_width(width: u8) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}

/// Reads a zero-extended little-endian integer of `width` bytes at `at`.
///
/// The caller has already checked that `at + width` lies within `bytes`.
#[inline]
fn read_le(bytes: &[u8], at: usize, width: u8) -> u64 {
    #[cfg(feature = "unchecked-reads")]
    let raw = unsafe { bytes.get_unchecked(at..at + width as usize) };
    #[cfg(not(feature = "unchecked-reads"))]
    let raw = &bytes[at..at + width as usize];

    match width {
        1 => raw[0] as u64,
        2 => u16::from_le_bytes([raw[0], raw[1]]) as u64,
        4 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64,
        _ => u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]),
    }
}

/// A read-only mapped file with a validated offsets table.
#[derive(Debug)]
pub struct OffsetTable {
    path: PathBuf,
    mmap: Option<Mmap>,
    layout: TableLayout,
    payload_offset: usize,
}

impl OffsetTable {
    /// Map `path` and validate the layout returned by `parse_header`.
    ///
    /// `parse_header` receives the whole mapped file and returns the table layout
    /// its header declares.
    pub fn open<P, F>(path: P, parse_header: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&[u8]) -> Result<TableLayout>,
    {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let layout = parse_header(&mmap)?;
        if !valid_width(layout.offset_width) || !valid_width(layout.value_width) {
            return Err(Error::corruption(format!(
                "{:?}: invalid widths (offset {}, value {})",
                path, layout.offset_width, layout.value_width
            )));
        }
        if !layout.payload_align.is_power_of_two() {
            return Err(Error::corruption(format!(
                "{:?}: payload alignment {} is not a power of two",
                path, layout.payload_align
            )));
        }
        let payload_offset = layout
            .payload_offset()
            .filter(|&end| end <= mmap.len() as u64)
            .ok_or_else(|| {
                Error::corruption(format!(
                    "{:?}: offsets table ({} entries at {}) exceeds file size {}",
                    path,
                    layout.entries,
                    layout.table_offset,
                    mmap.len()
                ))
            })?;

        Ok(Self { path, mmap: Some(mmap), layout, payload_offset: payload_offset as usize })
    }

    fn bytes(&self) -> Result<&[u8]> {
        match &self.mmap {
            Some(mmap) => Ok(&mmap[..]),
            None => Err(Error::invalid_state(format!("{:?} is closed", self.path))),
        }
    }

    /// The whole mapped file.
    pub fn file_bytes(&self) -> Result<&[u8]> {
        self.bytes()
    }

    /// The layout declared by the header.
    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the offsets table.
    pub fn entries(&self) -> u64 {
        self.layout.entries
    }

    /// Length of the payload area in bytes.
    pub fn payload_len(&self) -> Result<u64> {
        Ok((self.bytes()?.len() - self.payload_offset) as u64)
    }

    /// Read table entry `index`.
    #[inline]
    pub fn read_offset(&self, index: u64) -> Result<u64> {
        let bytes = self.bytes()?;
        if index >= self.layout.entries {
            return Err(Error::corruption(format!(
                "offset index {} out of range ({} entries)",
                index, self.layout.entries
            )));
        }
        let width = self.layout.offset_width;
        let at = self.layout.table_offset + index * width as u64;
        Ok(read_le(bytes, at as usize, width))
    }

    /// Read one value of `value_width` bytes at `byte_offset` within the payload.
    #[inline]
    pub fn read_value(&self, byte_offset: u64) -> Result<u64> {
        let bytes = self.bytes()?;
        let width = self.layout.value_width;
        let at = self.payload_offset as u64 + byte_offset;
        if byte_offset > bytes.len() as u64 || at + width as u64 > bytes.len() as u64 {
            return Err(Error::corruption(format!(
                "value at payload offset {} out of range",
                byte_offset
            )));
        }
        Ok(read_le(bytes, at as usize, width))
    }

    /// Zero-copy slice of the payload between two payload-relative offsets.
    #[inline]
    pub fn payload(&self, start: u64, end: u64) -> Result<&[u8]> {
        let bytes = self.bytes()?;
        let len = (bytes.len() - self.payload_offset) as u64;
        if start > end || end > len {
            return Err(Error::corruption(format!(
                "payload range {}..{} out of bounds (payload length {})",
                start, end, len
            )));
        }
        let start = self.payload_offset + start as usize;
        let end = self.payload_offset + end as usize;
        #[cfg(feature = "unchecked-reads")]
        let slice = unsafe { bytes.get_unchecked(start..end) };
        #[cfg(not(feature = "unchecked-reads"))]
        let slice = &bytes[start..end];
        Ok(slice)
    }

    /// Unmap the file. Idempotent.
    pub fn close(&mut self) {
        if self.mmap.take().is_some() {
            log::debug!("Unmapped {:?}", self.path);
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    /// Header: [entries: u8][offset width: u8][value width: u8][pad: u8]
    fn tiny_header(data: &[u8]) -> Result<TableLayout> {
        if data.len() < 4 {
            return Err(Error::corruption("header too short"));
        }
        Ok(TableLayout {
            table_offset: 4,
            entries: data[0] as u64,
            offset_width: data[1],
            value_width: data[2],
            payload_align: 1,
        })
    }

    #[test]
    fn test_read_offsets_and_values() {
        let mut bytes = vec![3, 2, 4, 0];
        for off in [0u16, 4, 8] {
            bytes.extend_from_slice(&off.to_le_bytes());
        }
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        let file = write_file(&bytes);

        let table = OffsetTable::open(file.path(), tiny_header).unwrap();
        assert_eq!(table.entries(), 3);
        assert_eq!(table.read_offset(0).unwrap(), 0);
        assert_eq!(table.read_offset(2).unwrap(), 8);
        assert_eq!(table.read_value(0).unwrap(), 7);
        assert_eq!(table.read_value(4).unwrap(), 0xdead_beef);
        assert_eq!(table.payload(4, 8).unwrap(), &0xdead_beefu32.to_le_bytes());
        assert_eq!(table.payload_len().unwrap(), 8);
    }

    #[test]
    fn test_bounds_are_checked() {
        let file = write_file(&[1, 1, 1, 0, 0, 42]);
        let table = OffsetTable::open(file.path(), tiny_header).unwrap();

        assert!(table.read_offset(1).is_err());
        assert_eq!(table.read_value(0).unwrap(), 42);
        assert!(table.read_value(1).is_err());
        assert!(table.payload(0, 2).is_err());
        assert!(table.payload(1, 0).is_err());
    }

    #[test]
    fn test_invalid_width_rejected() {
        let file = write_file(&[1, 3, 1, 0, 0, 0, 0]);
        let err = OffsetTable::open(file.path(), tiny_header).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_table_past_end_rejected() {
        let file = write_file(&[200, 8, 8, 0, 1, 2, 3]);
        let err = OffsetTable::open(file.path(), tiny_header).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let file = write_file(&[1, 1, 1, 0, 0]);
        let mut table = OffsetTable::open(file.path(), tiny_header).unwrap();

        table.close();
        table.close();
        assert!(table.is_closed());
        assert!(matches!(table.read_offset(0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(9, 8), Some(16));
        assert_eq!(align_up(16, 8), Some(16));
        assert_eq!(align_up(5, 1), Some(5));
        assert_eq!(align_up(u64::MAX, 8), None);
    }
}
