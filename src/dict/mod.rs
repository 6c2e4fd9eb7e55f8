//! Immutable memory-mapped term dictionaries.
//!
//! A dictionary maps each stored byte string to a dense id in
//! `[MIN_ID, MIN_ID + count)` and back again.
//!
//! ## File Format
//!
//! ```text
//! [Header: 8B]       // count (low 56 bits) | flags (top byte), little-endian
//! [Offsets Table]    // count + 1 entries of 4 or 8 bytes
//! [Payload]          // concatenated entry bytes in file order
//! ```
//!
//! Offset entry `i` is the start of entry `i` relative to the payload start;
//! entry `count` is the payload length.
//!
//! ## Lookup Variants
//!
//! - [`SortedLookup`]: entries sorted byte-lexicographically, binary search.
//! - [`LocalityLookup`]: entries laid out as an implicit complete binary tree.
//! - [`CompositeLookup`]: entries are `[code][marker][local]` referencing a
//!   shared dictionary.

pub mod composite;
pub mod locality;
pub mod sorted;
pub mod splitter;
pub mod syntax;
pub mod writer;

pub use composite::CompositeLookup;
pub use locality::{relayout_locality, LocalityLookup};
pub use sorted::SortedLookup;
pub use splitter::{SharedSide, Split, SplitMode, Splitter};
pub use syntax::TermSyntax;
pub use writer::DictWriter;

use crate::error::{Error, Result};
use crate::table::{OffsetTable, TableLayout};
use crate::{MIN_ID, NOT_FOUND};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;

/// Size of the header word.
pub const DICT_HEADER_SIZE: u64 = 8;

/// Mask selecting the count from the header word.
pub const COUNT_MASK: u64 = (1 << 56) - 1;

/// Flag bits stored in the top byte of the header word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DictFlags(u8);

impl DictFlags {
    /// Offsets are 8 bytes wide instead of 4.
    pub const OFFSETS_8: DictFlags = DictFlags(1 << 0);
    /// Entries reference a shared dictionary.
    pub const SHARED_DICT: DictFlags = DictFlags(1 << 1);
    /// Some entries overflowed the shared id range and use the sentinel code.
    pub const SHARED_OVERFLOW: DictFlags = DictFlags(1 << 2);
    /// Entries are laid out as an implicit binary tree.
    pub const LOCALITY: DictFlags = DictFlags(1 << 3);
    /// Composite entries were split with [`SplitMode::PrefixOnly`].
    pub const PREFIX_ONLY: DictFlags = DictFlags(1 << 4);

    const ALL: u8 = 0x1f;

    /// No flags set.
    pub const fn empty() -> Self {
        DictFlags(0)
    }

    /// Parse flag bits, rejecting unknown ones.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            return None;
        }
        Some(DictFlags(bits))
    }

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: DictFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with `other` set or cleared.
    pub fn with(self, other: DictFlags, value: bool) -> Self {
        if value {
            DictFlags(self.0 | other.0)
        } else {
            DictFlags(self.0 & !other.0)
        }
    }

    /// Whether no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Width of an offsets table entry.
    pub fn offset_width(self) -> u8 {
        if self.contains(Self::OFFSETS_8) {
            8
        } else {
            4
        }
    }
}

impl BitOr for DictFlags {
    type Output = DictFlags;

    fn bitor(self, rhs: DictFlags) -> DictFlags {
        DictFlags(self.0 | rhs.0)
    }
}

/// Split a header word into count and flags.
pub fn decode_header(word: u64) -> Result<(u64, DictFlags)> {
    let count = word & COUNT_MASK;
    let bits = (word >> 56) as u8;
    let flags = DictFlags::from_bits(bits)
        .ok_or_else(|| Error::corruption(format!("unknown dict flags {:#04x}", bits)))?;
    Ok((count, flags))
}

/// Build a header word from count and flags.
pub fn encode_header(count: u64, flags: DictFlags) -> u64 {
    (count & COUNT_MASK) | ((flags.bits() as u64) << 56)
}

/// A stored term, possibly split in two segments.
///
/// Composite dictionaries return the shared and local parts as separate
/// slices into the mapped files; nothing is copied.
#[derive(Clone, Copy)]
pub struct TermView<'a> {
    head: &'a [u8],
    tail: &'a [u8],
}

impl<'a> TermView<'a> {
    /// A view over one contiguous slice.
    pub fn single(bytes: &'a [u8]) -> Self {
        Self { head: bytes, tail: &[] }
    }

    /// A view over the concatenation `head ++ tail`.
    pub fn pair(head: &'a [u8], tail: &'a [u8]) -> Self {
        Self { head, tail }
    }

    /// First segment.
    pub fn head(&self) -> &'a [u8] {
        self.head
    }

    /// Second segment, empty for single views.
    pub fn tail(&self) -> &'a [u8] {
        self.tail
    }

    /// The view as one slice, when it does not span two segments.
    pub fn as_single(&self) -> Option<&'a [u8]> {
        if self.tail.is_empty() {
            Some(self.head)
        } else if self.head.is_empty() {
            Some(self.tail)
        } else {
            None
        }
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// Whether the term is the empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte at logical position `index`.
    pub fn byte(&self, index: usize) -> u8 {
        if index < self.head.len() {
            self.head[index]
        } else {
            self.tail[index - self.head.len()]
        }
    }

    /// Bytes `start..end` of the logical term.
    ///
    /// Borrowed when the range lies within one segment; copied when it spans both.
    pub fn slice(&self, start: usize, end: usize) -> Cow<'a, [u8]> {
        let split = self.head.len();
        if end <= split {
            Cow::Borrowed(&self.head[start..end])
        } else if start >= split {
            Cow::Borrowed(&self.tail[start - split..end - split])
        } else {
            let mut owned = Vec::with_capacity(end - start);
            owned.extend_from_slice(&self.head[start..]);
            owned.extend_from_slice(&self.tail[..end - split]);
            Cow::Owned(owned)
        }
    }

    /// Iterate over all bytes.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
        self.head.iter().chain(self.tail.iter()).copied()
    }

    /// Copy the term into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.head);
        out.extend_from_slice(self.tail);
        out
    }

    /// Byte-lexicographic comparison against a contiguous term.
    pub fn cmp_bytes(&self, other: &[u8]) -> Ordering {
        let n = self.head.len().min(other.len());
        match self.head[..n].cmp(&other[..n]) {
            Ordering::Equal if n == self.head.len() => self.tail.cmp(&other[n..]),
            Ordering::Equal => Ordering::Greater,
            ord => ord,
        }
    }
}

impl PartialEq<[u8]> for TermView<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.len() == other.len() && self.cmp_bytes(other) == Ordering::Equal
    }
}

impl PartialEq<&[u8]> for TermView<'_> {
    fn eq(&self, other: &&[u8]) -> bool {
        *self == **other
    }
}

impl PartialEq for TermView<'_> {
    fn eq(&self, other: &TermView<'_>) -> bool {
        self.len() == other.len() && self.bytes().eq(other.bytes())
    }
}

impl Eq for TermView<'_> {}

impl PartialEq<&str> for TermView<'_> {
    fn eq(&self, other: &&str) -> bool {
        *self == *other.as_bytes()
    }
}

impl fmt::Display for TermView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", String::from_utf8_lossy(self.head), String::from_utf8_lossy(self.tail))
    }
}

impl fmt::Debug for TermView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TermView({:?})", self.to_string())
    }
}

/// String/id lookups over an opened dictionary.
///
/// Implementations are immutable after open and safe to share between threads.
pub trait TermLookup: Send + Sync {
    /// Id of `term`, or [`NOT_FOUND`].
    fn find(&self, term: &[u8]) -> Result<u64>;

    /// Term stored under `id`, or `None` when `id` is out of range.
    fn get(&self, id: u64) -> Result<Option<TermView<'_>>>;

    /// Number of stored terms.
    fn len(&self) -> u64;

    /// Whether the dictionary holds no terms.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full integrity scan of the underlying file.
    fn validate(&self) -> Result<()>;

    /// Header flags of the underlying file.
    fn flags(&self) -> DictFlags;

    /// Unmap the underlying file. Idempotent.
    fn close(&mut self);
}

/// Open `path` with the lookup variant its header selects.
///
/// Composite dictionaries need `shared`; passing none is a configuration error.
pub fn open_lookup<P: AsRef<Path>>(
    path: P,
    shared: Option<Arc<dyn TermLookup>>,
) -> Result<Box<dyn TermLookup>> {
    let dict = Dict::open(path)?;
    let flags = dict.flags();
    if flags.contains(DictFlags::SHARED_DICT) {
        Ok(Box::new(CompositeLookup::new(dict, shared)?))
    } else if flags.contains(DictFlags::LOCALITY) {
        Ok(Box::new(LocalityLookup::new(dict)))
    } else {
        Ok(Box::new(SortedLookup::new(dict)))
    }
}

/// A mapped dictionary file.
///
/// `Dict` gives raw access to entries by file position; the lookup variants
/// build the string/id mapping on top of it.
#[derive(Debug)]
pub struct Dict {
    table: OffsetTable,
    count: u64,
    flags: DictFlags,
}

impl Dict {
    /// Map a dictionary file and read its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut header = (0, DictFlags::empty());
        let table = OffsetTable::open(path, |data| {
            if data.len() < DICT_HEADER_SIZE as usize {
                return Err(Error::corruption("dict file too small for header"));
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&data[..8]);
            header = decode_header(u64::from_le_bytes(word))?;
            Ok(TableLayout {
                table_offset: DICT_HEADER_SIZE,
                entries: header.0 + 1,
                offset_width: header.1.offset_width(),
                value_width: 1,
                payload_align: 1,
            })
        })?;
        let (count, flags) = header;

        log::debug!("Opened dict {:?}: {} entries, flags {:#04x}", table.path(), count, flags.bits());
        Ok(Self { table, count, flags })
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Whether the dictionary has no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Header flags.
    pub fn flags(&self) -> DictFlags {
        self.flags
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> Result<u64> {
        self.table.payload_len()
    }

    /// Entry at file position `index` (0-based).
    #[inline]
    pub fn entry(&self, index: u64) -> Result<&[u8]> {
        let start = self.table.read_offset(index)?;
        let end = self.table.read_offset(index + 1)?;
        self.table.payload(start, end)
    }

    /// Whether `id` lies in `[MIN_ID, MIN_ID + len)`.
    pub fn contains_id(&self, id: u64) -> bool {
        id >= MIN_ID && id - MIN_ID < self.count
    }

    /// Binary search over a flat sorted file. Returns the file position.
    pub fn search(&self, key: &[u8]) -> Result<Option<u64>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entry(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }

    /// Iterate entries in file order.
    pub fn iter(&self) -> DictIter<'_> {
        DictIter { dict: self, next: 0 }
    }

    /// Check offsets and entry order, then check each entry against `syntax`.
    ///
    /// Flat files must be strictly ascending; locality files must be strictly
    /// ascending in tree in-order.
    pub fn validate(&self, syntax: TermSyntax) -> Result<()> {
        let payload_len = self.table.payload_len()?;
        if self.table.read_offset(0)? != 0 {
            return Err(Error::corruption(format!("{:?}: first offset is not zero", self.path())));
        }
        let mut prev = 0;
        for index in 1..=self.count {
            let offset = self.table.read_offset(index)?;
            if offset < prev {
                return Err(Error::corruption(format!(
                    "{:?}: offsets not monotonic at entry {}",
                    self.path(),
                    index
                )));
            }
            prev = offset;
        }
        if prev != payload_len {
            return Err(Error::corruption(format!(
                "{:?}: final offset {} does not match payload length {}",
                self.path(),
                prev,
                payload_len
            )));
        }

        let locality = self.flags.contains(DictFlags::LOCALITY);
        let mut last: Option<&[u8]> = None;
        for rank in 0..self.count {
            let position = if locality {
                locality::node_of_rank(rank, self.count) - 1
            } else {
                rank
            };
            let entry = self.entry(position)?;
            if let Some(last) = last {
                if last >= entry {
                    return Err(Error::corruption(format!(
                        "{:?}: entries out of order at rank {}",
                        self.path(),
                        rank
                    )));
                }
            }
            if !syntax.accepts(entry) {
                return Err(Error::corruption(format!(
                    "{:?}: malformed entry at rank {}: {:?}",
                    self.path(),
                    rank,
                    String::from_utf8_lossy(entry)
                )));
            }
            last = Some(entry);
        }
        Ok(())
    }

    /// Unmap the file. Idempotent; later reads fail with an invalid state error.
    pub fn close(&mut self) {
        self.table.close();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.table.is_closed()
    }
}

/// Iterator over dictionary entries in file order.
pub struct DictIter<'a> {
    dict: &'a Dict,
    next: u64,
}

impl<'a> Iterator for DictIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dict.count {
            return None;
        }
        let entry = self.dict.entry(self.next);
        self.next += 1;
        Some(entry)
    }
}

/// Resolve an id through the sorted mapping shared by flat files.
pub(crate) fn flat_position(dict: &Dict, id: u64) -> Option<u64> {
    if dict.contains_id(id) {
        Some(id - MIN_ID)
    } else {
        None
    }
}

/// Map a file position found by a search to an id.
pub(crate) fn position_to_id(position: Option<u64>) -> u64 {
    position.map_or(NOT_FOUND, |p| p + MIN_ID)
}
