//! Triple index writer.
//!
//! The key count, and with it the size of the offsets table, is only known at
//! the end, so offsets and pairs are streamed into two anonymous temp files
//! next to the destination and assembled by `finish`.

use crate::error::{Error, Result};
use crate::table::align_up;
use crate::triples::{IdWidth, FLAG_IDS_8, FLAG_OFFSETS_8, TRIPLES_HEADER_SIZE};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Writes one permutation index from `(key, sub_key, value)` records in
/// strictly ascending order.
///
/// Usage:
/// ```no_run
/// use termstore::triples::{IdWidth, TriplesWriter};
///
/// let mut writer = TriplesWriter::create("spo.idx", IdWidth::Four).unwrap();
/// writer.add(1, 2, 3).unwrap();
/// writer.add(1, 2, 4).unwrap();
/// writer.add(2, 1, 1).unwrap();
/// writer.finish().unwrap();
/// ```
pub struct TriplesWriter {
    path: PathBuf,
    id_width: IdWidth,
    offsets: BufWriter<File>,
    pairs: BufWriter<File>,
    first_key: Option<u64>,
    current_key: u64,
    key_count: u64,
    pair_bytes: u64,
    last: Option<[u64; 3]>,
}

impl TriplesWriter {
    /// Create a writer for `path` storing ids at `id_width`.
    pub fn create<P: AsRef<Path>>(path: P, id_width: IdWidth) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            offsets: BufWriter::new(tempfile::tempfile_in(&dir)?),
            pairs: BufWriter::new(tempfile::tempfile_in(&dir)?),
            path,
            id_width,
            first_key: None,
            current_key: 0,
            key_count: 0,
            pair_bytes: 0,
            last: None,
        })
    }

    fn put_id(&mut self, id: u64) -> io::Result<()> {
        match self.id_width {
            IdWidth::Four => self.pairs.write_all(&(id as u32).to_le_bytes()),
            IdWidth::Eight => self.pairs.write_all(&id.to_le_bytes()),
        }
    }

    fn start_key(&mut self) -> io::Result<()> {
        self.offsets.write_all(&self.pair_bytes.to_le_bytes())?;
        self.key_count += 1;
        Ok(())
    }

    /// Append one record.
    pub fn add(&mut self, key: u64, sub_key: u64, value: u64) -> Result<()> {
        if key == 0 || sub_key == 0 || value == 0 {
            return Err(Error::invalid_argument(format!(
                "id 0 is not valid: ({}, {}, {})",
                key, sub_key, value
            )));
        }
        if self.id_width == IdWidth::Four && key.max(sub_key).max(value) > u32::MAX as u64 {
            return Err(Error::invalid_argument("id exceeds the 4-byte id width"));
        }
        let record = [key, sub_key, value];
        if let Some(last) = self.last {
            if record <= last {
                return Err(Error::invalid_argument(
                    "Records must be added in strictly ascending order",
                ));
            }
        }

        match self.first_key {
            None => {
                self.first_key = Some(key);
                self.current_key = key;
                self.start_key()?;
            }
            Some(_) => {
                while self.current_key < key {
                    self.current_key += 1;
                    self.start_key()?;
                }
            }
        }
        self.put_id(sub_key)?;
        self.put_id(value)?;
        self.pair_bytes += 2 * self.id_width.bytes() as u64;
        self.last = Some(record);
        Ok(())
    }

    /// Number of keys in the contiguous key range so far.
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Assemble the final file. Returns its size.
    pub fn finish(mut self) -> Result<u64> {
        self.offsets.write_all(&self.pair_bytes.to_le_bytes())?;
        let offset_width: u64 = if self.pair_bytes > u32::MAX as u64 { 8 } else { 4 };

        let mut flags = 0u8;
        if self.id_width == IdWidth::Eight {
            flags |= FLAG_IDS_8;
        }
        if offset_width == 8 {
            flags |= FLAG_OFFSETS_8;
        }

        let mut out = BufWriter::new(
            OpenOptions::new().write(true).create(true).truncate(true).open(&self.path)?,
        );
        let mut header = BytesMut::with_capacity(TRIPLES_HEADER_SIZE as usize);
        header.put_u64_le(self.key_count | ((flags as u64) << 56));
        header.put_u64_le(self.first_key.unwrap_or(0));
        out.write_all(&header)?;

        let mut offsets = rewind(self.offsets)?;
        let mut word = [0u8; 8];
        for _ in 0..=self.key_count {
            offsets.read_exact(&mut word)?;
            if offset_width == 8 {
                out.write_all(&word)?;
            } else {
                out.write_all(&word[..4])?;
            }
        }

        let table_end = TRIPLES_HEADER_SIZE + (self.key_count + 1) * offset_width;
        let pair_start = align_up(table_end, 8)
            .ok_or_else(|| Error::invalid_state("triples table size overflow"))?;
        out.write_all(&vec![0u8; (pair_start - table_end) as usize])?;

        let mut pairs = rewind(self.pairs)?;
        let copied = io::copy(&mut pairs, &mut out)?;
        if copied != self.pair_bytes {
            return Err(Error::invalid_state(format!(
                "pair area holds {} bytes, expected {}",
                copied, self.pair_bytes
            )));
        }

        out.flush()?;
        let file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;

        let size = pair_start + self.pair_bytes;
        log::debug!(
            "Wrote {:?}: {} keys, {} pairs, {} bytes",
            self.path,
            self.key_count,
            self.pair_bytes / (2 * self.id_width.bytes() as u64),
            size
        );
        Ok(size)
    }
}

fn rewind(writer: BufWriter<File>) -> Result<BufReader<File>> {
    let mut file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(BufReader::new(file))
}
