//! Dictionary writer.
//!
//! Writes a stream of entries into the dictionary file format. The layout is
//! fixed up front from the declared entry count:
//!
//! ```text
//! [Header: 8B][Offsets: (declared + 1) x width][Payload ...]
//! ```
//!
//! Offsets and payload are streamed through two independent handles. If fewer
//! entries than declared arrive, `close` moves the payload down to sit right
//! after the shorter table.

use crate::dict::{decode_header, encode_header, DictFlags, COUNT_MASK, DICT_HEADER_SIZE};
use crate::error::{Error, Result};
use bytes::BufMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 1 << 20;

/// DictWriter builds a dictionary file from entries supplied in order.
///
/// Entries must be strictly ascending unless the locality flag is set, in
/// which case the caller supplies tree order. The writer never sorts.
///
/// All methods take `&self`; a call made while another is in progress fails
/// with [`Error::ConcurrentUse`] instead of interleaving writes.
///
/// Usage:
/// ```no_run
/// use termstore::dict::{DictFlags, DictWriter};
///
/// let writer = DictWriter::create("terms.dict", 2, 8, DictFlags::empty()).unwrap();
/// writer.write_sorted(b"<a>").unwrap();
/// writer.write_sorted(b"<b>").unwrap();
/// writer.close().unwrap();
/// ```
pub struct DictWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
}

struct WriterState {
    header: File,
    offsets: BufWriter<File>,
    payload: BufWriter<File>,
    flags: DictFlags,
    declared: u64,
    count: u64,
    payload_len: u64,
    last: Vec<u8>,
    closed: bool,
}

impl DictWriter {
    /// Create `path` for `declared_count` entries totalling about `declared_bytes`.
    ///
    /// The offset width is 4 bytes unless `declared_bytes` exceeds the 32-bit
    /// range; the `OFFSETS_8` bit in `flags` is derived, not taken from the caller.
    pub fn create<P: AsRef<Path>>(
        path: P,
        declared_count: u64,
        declared_bytes: u64,
        flags: DictFlags,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if declared_count > COUNT_MASK - 1 {
            return Err(Error::invalid_argument(format!(
                "declared count {} exceeds the header range",
                declared_count
            )));
        }
        let flags = flags.with(DictFlags::OFFSETS_8, declared_bytes > u32::MAX as u64);
        let width = flags.offset_width() as u64;
        let payload_start = DICT_HEADER_SIZE + (declared_count + 1) * width;

        let header = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
        let mut offsets = OpenOptions::new().write(true).open(&path)?;
        offsets.seek(SeekFrom::Start(DICT_HEADER_SIZE))?;
        let mut payload = OpenOptions::new().read(true).write(true).open(&path)?;
        payload.seek(SeekFrom::Start(payload_start))?;

        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                header,
                offsets: BufWriter::new(offsets),
                payload: BufWriter::new(payload),
                flags,
                declared: declared_count,
                count: 0,
                payload_len: 0,
                last: Vec::new(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, WriterState>> {
        self.state
            .try_lock()
            .ok_or_else(|| Error::concurrent_use(format!("dict writer {:?} is busy", self.path)))
    }

    /// Append the next entry.
    pub fn write_sorted(&self, term: &[u8]) -> Result<()> {
        self.lock()?.append(term)
    }

    /// Number of entries written so far.
    pub fn count(&self) -> Result<u64> {
        Ok(self.lock()?.count)
    }

    /// Offset width chosen at creation.
    pub fn offset_width(&self) -> Result<u8> {
        Ok(self.lock()?.flags.offset_width())
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish the file: final offset, header, flush and fsync.
    ///
    /// Must be called exactly once. Returns the file size.
    pub fn close(&self) -> Result<u64> {
        let size = self.lock()?.finish()?;
        log::debug!("Closed dict writer {:?} ({} bytes)", self.path, size);
        Ok(size)
    }
}

impl WriterState {
    fn width(&self) -> u8 {
        self.flags.offset_width()
    }

    fn put_offset(&mut self, offset: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        let mut slot = &mut buf[..];
        if self.width() == 8 {
            slot.put_u64_le(offset);
        } else {
            slot.put_u32_le(offset as u32);
        }
        self.offsets.write_all(&buf[..self.width() as usize])?;
        Ok(())
    }

    fn append(&mut self, term: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state("dict writer already closed"));
        }
        if self.count >= self.declared {
            return Err(Error::invalid_state(format!(
                "more entries than the {} declared",
                self.declared
            )));
        }
        if !self.flags.contains(DictFlags::LOCALITY)
            && self.count > 0
            && term <= self.last.as_slice()
        {
            return Err(Error::invalid_argument("Entries must be added in strictly ascending order"));
        }
        let end = self.payload_len + term.len() as u64;
        if self.width() == 4 && end > u32::MAX as u64 {
            return Err(Error::invalid_state(format!(
                "payload of {} bytes exceeds 4-byte offsets",
                end
            )));
        }

        self.put_offset(self.payload_len)?;
        self.payload.write_all(term)?;
        self.payload_len = end;
        self.count += 1;
        self.last.clear();
        self.last.extend_from_slice(term);
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        if self.closed {
            return Err(Error::invalid_state("dict writer already closed"));
        }
        self.closed = true;

        self.put_offset(self.payload_len)?;
        self.offsets.flush()?;
        self.payload.flush()?;

        let width = self.width() as u64;
        let reserved_start = DICT_HEADER_SIZE + (self.declared + 1) * width;
        let payload_start = DICT_HEADER_SIZE + (self.count + 1) * width;
        if payload_start < reserved_start {
            self.shift_payload(reserved_start, payload_start)?;
        }
        let size = payload_start + self.payload_len;
        self.header.set_len(size)?;

        self.header.seek(SeekFrom::Start(0))?;
        self.header.write_all(&encode_header(self.count, self.flags).to_le_bytes())?;
        self.header.sync_all()?;
        Ok(size)
    }

    /// Copy the payload from `from` down to `to` (`to < from`).
    fn shift_payload(&mut self, from: u64, to: u64) -> Result<()> {
        let file = self.payload.get_mut();
        let mut buf = vec![0u8; COPY_CHUNK.min(self.payload_len as usize).max(1)];
        let mut done = 0u64;
        while done < self.payload_len {
            let n = buf.len().min((self.payload_len - done) as usize);
            file.seek(SeekFrom::Start(from + done))?;
            let mut reader = &*file;
            reader.read_exact(&mut buf[..n])?;
            file.seek(SeekFrom::Start(to + done))?;
            file.write_all(&buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }
}

impl Drop for DictWriter {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            log::warn!("Dict writer {:?} dropped without close; file is incomplete", self.path);
        }
    }
}

/// Rewrite the flag byte of an existing dictionary file.
///
/// The offset-width bit is kept from the file; every other bit comes from `flags`.
pub fn patch_flags<P: AsRef<Path>>(path: P, flags: DictFlags) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
    let mut word = [0u8; 8];
    file.read_exact(&mut word)?;
    let (count, current) = decode_header(u64::from_le_bytes(word))?;
    let width8 = current.contains(DictFlags::OFFSETS_8);
    let patched = flags.with(DictFlags::OFFSETS_8, width8);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode_header(count, patched).to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Dict;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dict");

        let writer = DictWriter::create(&path, 3, 9, DictFlags::empty()).unwrap();
        writer.write_sorted(b"").unwrap();
        writer.write_sorted(b"<a>").unwrap();
        writer.write_sorted(b"<bcd>").unwrap();
        assert_eq!(writer.offset_width().unwrap(), 4);
        let size = writer.close().unwrap();
        assert_eq!(size, 8 + 4 * 4 + 8);

        let dict = Dict::open(&path).unwrap();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.entry(0).unwrap(), b"");
        assert_eq!(dict.entry(1).unwrap(), b"<a>");
        assert_eq!(dict.entry(2).unwrap(), b"<bcd>");
    }

    #[test]
    fn test_fewer_entries_than_declared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dict");

        let writer = DictWriter::create(&path, 10, 100, DictFlags::empty()).unwrap();
        writer.write_sorted(b"<x>").unwrap();
        writer.write_sorted(b"<y>").unwrap();
        writer.close().unwrap();

        let dict = Dict::open(&path).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.entry(1).unwrap(), b"<y>");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 + 3 * 4 + 6);
    }

    #[test]
    fn test_rejects_unsorted() {
        let dir = TempDir::new().unwrap();
        let writer = DictWriter::create(dir.path().join("t.dict"), 3, 9, DictFlags::empty()).unwrap();

        writer.write_sorted(b"<b>").unwrap();
        assert!(matches!(writer.write_sorted(b"<a>"), Err(Error::InvalidArgument(_))));
        assert!(matches!(writer.write_sorted(b"<b>"), Err(Error::InvalidArgument(_))));
        writer.close().unwrap();
    }

    #[test]
    fn test_overrun_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let writer = DictWriter::create(dir.path().join("t.dict"), 1, 3, DictFlags::empty()).unwrap();

        writer.write_sorted(b"<a>").unwrap();
        assert!(matches!(writer.write_sorted(b"<b>"), Err(Error::InvalidState(_))));
        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_concurrent_use_fails_fast() {
        let dir = TempDir::new().unwrap();
        let writer = DictWriter::create(dir.path().join("t.dict"), 2, 6, DictFlags::empty()).unwrap();

        let guard = writer.state.lock();
        assert!(matches!(writer.write_sorted(b"<a>"), Err(Error::ConcurrentUse(_))));
        assert!(matches!(writer.close(), Err(Error::ConcurrentUse(_))));
        drop(guard);

        writer.write_sorted(b"<a>").unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_wide_offsets_when_declared_large() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dict");

        let writer = DictWriter::create(&path, 1, u32::MAX as u64 + 1, DictFlags::empty()).unwrap();
        assert_eq!(writer.offset_width().unwrap(), 8);
        writer.write_sorted(b"<a>").unwrap();
        writer.close().unwrap();

        let dict = Dict::open(&path).unwrap();
        assert!(dict.flags().contains(DictFlags::OFFSETS_8));
        assert_eq!(dict.entry(0).unwrap(), b"<a>");
    }

    #[test]
    fn test_patch_flags_keeps_width() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dict");

        let writer = DictWriter::create(&path, 1, 3, DictFlags::empty()).unwrap();
        writer.write_sorted(b"AAAB.x").unwrap();
        writer.close().unwrap();

        patch_flags(&path, DictFlags::SHARED_DICT | DictFlags::OFFSETS_8).unwrap();
        let dict = Dict::open(&path).unwrap();
        assert!(dict.flags().contains(DictFlags::SHARED_DICT));
        assert!(!dict.flags().contains(DictFlags::OFFSETS_8));
        assert_eq!(dict.entry(0).unwrap(), b"AAAB.x");
    }
}
