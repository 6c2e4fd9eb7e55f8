//! Read side of a permutation index.

use crate::error::{Error, Result};
use crate::table::{OffsetTable, TableLayout};
use crate::triples::{IdWidth, FLAG_IDS_8, FLAG_OFFSETS_8, TRIPLES_HEADER_SIZE};
use bytes::Buf;
use std::cmp::Ordering;
use std::ops::Range;
use std::path::Path;

const COUNT_MASK: u64 = (1 << 56) - 1;
const KNOWN_FLAGS: u8 = FLAG_IDS_8 | FLAG_OFFSETS_8;

#[inline]
fn decode_id(run: &[u8], at: usize, width: usize) -> u64 {
    let mut buf = &run[at..at + width];
    if width == 4 {
        buf.get_u32_le() as u64
    } else {
        buf.get_u64_le()
    }
}

/// A mapped permutation index.
///
/// Lookups borrow the mapping; cursors decode straight from the mapped pair
/// run of one key.
#[derive(Debug)]
pub struct Triples {
    table: OffsetTable,
    first_key: u64,
    key_count: u64,
    id_width: IdWidth,
}

impl Triples {
    /// Map a triples file and read its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut header = (0u64, 0u64, IdWidth::Four);
        let table = OffsetTable::open(path, |data| {
            if data.len() < TRIPLES_HEADER_SIZE as usize {
                return Err(Error::corruption("triples file too small for header"));
            }
            let mut buf = data;
            let word = buf.get_u64_le();
            let first_key = buf.get_u64_le();
            let flags = (word >> 56) as u8;
            if flags & !KNOWN_FLAGS != 0 {
                return Err(Error::corruption(format!("unknown triples flags {:#04x}", flags)));
            }
            let id_width = if flags & FLAG_IDS_8 != 0 { IdWidth::Eight } else { IdWidth::Four };
            let key_count = word & COUNT_MASK;
            header = (key_count, first_key, id_width);
            Ok(TableLayout {
                table_offset: TRIPLES_HEADER_SIZE,
                entries: key_count + 1,
                offset_width: if flags & FLAG_OFFSETS_8 != 0 { 8 } else { 4 },
                value_width: id_width.bytes(),
                payload_align: 8,
            })
        })?;
        let (key_count, first_key, id_width) = header;
        if key_count > 0 && first_key == 0 {
            return Err(Error::corruption(format!("{:?}: first key is 0", table.path())));
        }

        log::debug!(
            "Opened triples {:?}: {} keys from {}, {}-byte ids",
            table.path(),
            key_count,
            first_key,
            id_width.bytes()
        );
        Ok(Self { table, first_key, key_count, id_width })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// Width of stored ids.
    pub fn id_width(&self) -> IdWidth {
        self.id_width
    }

    /// Number of keys in the contiguous key range.
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// The contiguous range of keys covered by this file.
    pub fn key_range(&self) -> Range<u64> {
        self.first_key..self.first_key.saturating_add(self.key_count)
    }

    fn pair_width(&self) -> usize {
        2 * self.id_width.bytes() as usize
    }

    /// Total number of stored pairs.
    pub fn pair_count(&self) -> Result<u64> {
        Ok(self.table.read_offset(self.key_count)? / self.pair_width() as u64)
    }

    /// The pair at `position` of the whole pair area, counting across keys in
    /// key order.
    pub fn pair_at(&self, position: u64) -> Result<(u64, u64)> {
        let count = self.pair_count()?;
        if position >= count {
            return Err(Error::invalid_argument(format!(
                "pair position {} out of range ({} pairs)",
                position, count
            )));
        }
        let at = position * self.pair_width() as u64;
        let sub_key = self.table.read_value(at)?;
        let value = self.table.read_value(at + self.id_width.bytes() as u64)?;
        Ok((sub_key, value))
    }

    /// The raw pair run of `key`, empty for keys outside the range.
    fn run(&self, key: u64) -> Result<&[u8]> {
        if !self.key_range().contains(&key) {
            return Ok(&[]);
        }
        let index = key - self.first_key;
        let start = self.table.read_offset(index)?;
        let end = self.table.read_offset(index + 1)?;
        let run = self.table.payload(start, end)?;
        if run.len() % self.pair_width() != 0 {
            return Err(Error::corruption(format!(
                "run of key {} is {} bytes, not a multiple of the pair width",
                key,
                run.len()
            )));
        }
        Ok(run)
    }

    /// All `(sub_key, value)` pairs of `key`, ascending.
    pub fn pairs(&self, key: u64) -> Result<PairCursor<'_>> {
        Ok(PairCursor::new(self.run(key)?, self.id_width))
    }

    /// The values stored under `(key, sub_key)`, ascending.
    ///
    /// Binary search lands on some pair with `sub_key`, then the bounds of the
    /// matching stretch are found by walking left and right from it.
    pub fn values(&self, key: u64, sub_key: u64) -> Result<ValueCursor<'_>> {
        let run = self.run(key)?;
        let width = self.id_width.bytes() as usize;
        let pair = 2 * width;
        let n = run.len() / pair;
        let sub_key_at = |i: usize| decode_id(run, i * pair, width);

        let (mut lo, mut hi) = (0, n);
        let mut hit = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match sub_key_at(mid).cmp(&sub_key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => {
                    hit = Some(mid);
                    break;
                }
            }
        }

        let (start, end) = match hit {
            Some(mid) => {
                let mut start = mid;
                while start > 0 && sub_key_at(start - 1) == sub_key {
                    start -= 1;
                }
                let mut end = mid + 1;
                while end < n && sub_key_at(end) == sub_key {
                    end += 1;
                }
                (start, end)
            }
            None => (0, 0),
        };
        Ok(ValueCursor { run: &run[start * pair..end * pair], width, pos: 0 })
    }

    /// The sub-keys stored with `value` under `key`, ascending.
    pub fn sub_keys(&self, key: u64, value: u64) -> Result<SubKeyCursor<'_>> {
        let run = self.run(key)?;
        Ok(SubKeyCursor {
            run,
            width: self.id_width.bytes() as usize,
            len: run.len() / self.pair_width(),
            pos: 0,
            target: value,
        })
    }

    /// Whether `(key, sub_key, value)` is stored.
    pub fn contains(&self, key: u64, sub_key: u64, value: u64) -> Result<bool> {
        Ok(self.values(key, sub_key)?.any(|v| v == value))
    }

    /// Check offsets, alignment and pair order.
    ///
    /// Offsets must start at zero, never decrease, stay multiples of the pair
    /// width and end at the pair area length. Pairs within each key must be
    /// strictly ascending and free of zero ids.
    pub fn validate(&self) -> Result<()> {
        let path = self.path();
        if self.first_key.checked_add(self.key_count).is_none() {
            return Err(Error::corruption(format!("{:?}: key range overflows", path)));
        }
        if self.table.read_offset(0)? != 0 {
            return Err(Error::corruption(format!("{:?}: first offset is not zero", path)));
        }
        let pair = self.pair_width() as u64;
        let mut prev = 0;
        for index in 1..=self.key_count {
            let offset = self.table.read_offset(index)?;
            if offset < prev {
                return Err(Error::corruption(format!(
                    "{:?}: offset {} decreases ({} < {})",
                    path, index, offset, prev
                )));
            }
            if offset % pair != 0 {
                return Err(Error::corruption(format!(
                    "{:?}: offset {} ({}) is not pair aligned",
                    path, index, offset
                )));
            }
            prev = offset;
        }
        let payload_len = self.table.payload_len()?;
        if prev != payload_len {
            return Err(Error::corruption(format!(
                "{:?}: final offset {} does not match pair area length {}",
                path, prev, payload_len
            )));
        }

        for key in self.key_range() {
            let mut last: Option<(u64, u64)> = None;
            for (sub_key, value) in self.pairs(key)? {
                if sub_key == 0 || value == 0 {
                    return Err(Error::corruption(format!("{:?}: zero id under key {}", path, key)));
                }
                if let Some(last) = last {
                    if (sub_key, value) <= last {
                        return Err(Error::corruption(format!(
                            "{:?}: pairs of key {} are not strictly ascending",
                            path, key
                        )));
                    }
                }
                last = Some((sub_key, value));
            }
        }
        Ok(())
    }

    /// Unmap the file. Idempotent.
    pub fn close(&mut self) {
        self.table.close();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.table.is_closed()
    }
}

/// Cursor over the `(sub_key, value)` pairs of one key.
#[derive(Debug, Clone)]
pub struct PairCursor<'a> {
    run: &'a [u8],
    width: usize,
    pos: usize,
}

impl<'a> PairCursor<'a> {
    fn new(run: &'a [u8], id_width: IdWidth) -> Self {
        Self { run, width: id_width.bytes() as usize, pos: 0 }
    }

    /// Pairs not yet returned.
    pub fn remaining(&self) -> usize {
        (self.run.len() - self.pos) / (2 * self.width)
    }
}

impl Iterator for PairCursor<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.pos >= self.run.len() {
            return None;
        }
        let sub_key = decode_id(self.run, self.pos, self.width);
        let value = decode_id(self.run, self.pos + self.width, self.width);
        self.pos += 2 * self.width;
        Some((sub_key, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for PairCursor<'_> {}

/// Cursor over the values of one `(key, sub_key)`.
#[derive(Debug, Clone)]
pub struct ValueCursor<'a> {
    run: &'a [u8],
    width: usize,
    pos: usize,
}

impl Iterator for ValueCursor<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.pos >= self.run.len() {
            return None;
        }
        let value = decode_id(self.run, self.pos + self.width, self.width);
        self.pos += 2 * self.width;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.run.len() - self.pos) / (2 * self.width);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ValueCursor<'_> {}

/// Cursor over the sub-keys paired with one value.
///
/// Scans four pairs per step and falls back to single pairs near the end of
/// the run.
#[derive(Debug, Clone)]
pub struct SubKeyCursor<'a> {
    run: &'a [u8],
    width: usize,
    len: usize,
    pos: usize,
    target: u64,
}

impl SubKeyCursor<'_> {
    #[inline]
    fn value_at(&self, index: usize) -> u64 {
        decode_id(self.run, index * 2 * self.width + self.width, self.width)
    }

    #[inline]
    fn sub_key_at(&self, index: usize) -> u64 {
        decode_id(self.run, index * 2 * self.width, self.width)
    }

    /// Bit `i` is set when pair `pos + i` holds the target value.
    #[inline]
    fn match_mask(&self, pos: usize) -> u32 {
        let t = self.target;
        (self.value_at(pos) == t) as u32
            | ((self.value_at(pos + 1) == t) as u32) << 1
            | ((self.value_at(pos + 2) == t) as u32) << 2
            | ((self.value_at(pos + 3) == t) as u32) << 3
    }
}

impl Iterator for SubKeyCursor<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.pos + 4 <= self.len {
            let mask = self.match_mask(self.pos);
            if mask == 0 {
                self.pos += 4;
                continue;
            }
            let hit = self.pos + mask.trailing_zeros() as usize;
            self.pos = hit + 1;
            return Some(self.sub_key_at(hit));
        }
        while self.pos < self.len {
            let index = self.pos;
            self.pos += 1;
            if self.value_at(index) == self.target {
                return Some(self.sub_key_at(index));
            }
        }
        None
    }
}
