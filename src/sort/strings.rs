//! String sorting into dictionary files.
//!
//! Run files use the dictionary format itself, so a single spilled run can be
//! renamed into place and runs are merged by reading them as dictionaries.

use crate::config::SortOptions;
use crate::dict::writer::{patch_flags, DictWriter};
use crate::dict::{relayout_locality, Dict, DictFlags};
use crate::error::{Error, Result};
use crate::sort::{KWayMerge, RunCursor, SortBlock, SortCodec, SortedRuns, Sorter};
use std::fs;
use std::path::Path;

/// Staging block of variable-length byte strings.
///
/// Strings are appended to one byte arena; sorting permutes the span table
/// and leaves the arena untouched.
pub struct StringBlock {
    data: Vec<u8>,
    spans: Vec<(u32, u32)>,
    max_bytes: usize,
    max_items: usize,
}

impl StringBlock {
    /// Allocate a block holding up to `max_items` strings in `max_bytes` bytes.
    pub fn with_capacity(max_bytes: usize, max_items: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_bytes),
            spans: Vec::with_capacity(max_items),
            max_bytes,
            max_items,
        }
    }

    /// String at position `index`.
    pub fn get(&self, index: usize) -> &[u8] {
        let (start, len) = self.spans[index];
        &self.data[start as usize..(start + len) as usize]
    }

    /// Iterate strings in their current order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.spans.len()).map(move |i| self.get(i))
    }

    /// Total length of the strings currently listed.
    pub fn payload_len(&self) -> u64 {
        self.spans.iter().map(|&(_, len)| len as u64).sum()
    }

    /// Sort byte-lexicographically and drop duplicates.
    pub fn sort_dedup(&mut self) {
        let data = &self.data;
        let slice = |&(start, len): &(u32, u32)| &data[start as usize..(start + len) as usize];
        self.spans.sort_unstable_by(|a, b| slice(a).cmp(slice(b)));
        self.spans.dedup_by(|a, b| slice(a) == slice(b));
    }
}

impl SortBlock for StringBlock {
    type Item = [u8];

    fn push(&mut self, item: &[u8]) -> bool {
        if self.spans.len() >= self.max_items || self.data.len() + item.len() > self.max_bytes {
            return false;
        }
        let start = self.data.len() as u32;
        self.data.extend_from_slice(item);
        self.spans.push((start, item.len() as u32));
        true
    }

    fn recent_contains(&self, item: &[u8], window: usize) -> bool {
        let first = self.spans.len().saturating_sub(window);
        (first..self.spans.len()).any(|i| self.get(i) == item)
    }

    fn is_full(&self) -> bool {
        self.spans.len() >= self.max_items || self.data.len() >= self.max_bytes
    }

    fn len(&self) -> usize {
        self.spans.len()
    }

    fn clear(&mut self) {
        self.data.clear();
        self.spans.clear();
    }
}

/// Cursor over a string run file.
pub struct DictRunCursor {
    dict: Dict,
    next: u64,
    key: Vec<u8>,
    valid: bool,
}

impl DictRunCursor {
    fn open(path: &Path) -> Result<Self> {
        let dict = Dict::open(path)?;
        let mut cursor = Self { dict, next: 0, key: Vec::new(), valid: false };
        cursor.advance()?;
        Ok(cursor)
    }
}

impl RunCursor for DictRunCursor {
    type Key = [u8];

    fn peek(&self) -> Option<&[u8]> {
        if self.valid {
            Some(&self.key)
        } else {
            None
        }
    }

    fn advance(&mut self) -> Result<()> {
        if self.next >= self.dict.len() {
            self.valid = false;
            return Ok(());
        }
        let entry = self.dict.entry(self.next)?;
        self.key.clear();
        self.key.extend_from_slice(entry);
        self.next += 1;
        self.valid = true;
        Ok(())
    }
}

/// [`SortCodec`] producing dictionary files.
#[derive(Debug, Clone)]
pub struct StringCodec {
    options: SortOptions,
}

impl StringCodec {
    /// Codec sizing its blocks from `options`.
    pub fn new(options: SortOptions) -> Self {
        Self { options }
    }

    fn write_block(block: &StringBlock, path: &Path, flags: DictFlags) -> Result<()> {
        let writer = DictWriter::create(path, block.len() as u64, block.payload_len(), flags)?;
        for term in block.iter() {
            writer.write_sorted(term)?;
        }
        writer.close()?;
        Ok(())
    }

    /// Produce `dest` through `write_flat`, which writes sorted entries.
    ///
    /// With the locality flag set, `write_flat` targets a temporary flat file
    /// that is then rearranged into tree order at `dest` and removed.
    fn write_layout<F>(dest: &Path, flags: DictFlags, write_flat: F) -> Result<()>
    where
        F: FnOnce(&Path, DictFlags) -> Result<()>,
    {
        if !flags.contains(DictFlags::LOCALITY) {
            return write_flat(dest, flags);
        }
        if flags.contains(DictFlags::SHARED_DICT) {
            return Err(Error::config("composite dicts cannot use the locality layout"));
        }

        let flat_path = dest.with_extension("flat.tmp");
        let result = write_flat(&flat_path, flags.with(DictFlags::LOCALITY, false))
            .and_then(|()| Dict::open(&flat_path))
            .and_then(|flat| relayout_locality(&flat, dest).map(drop));
        if flat_path.exists() {
            if let Err(e) = fs::remove_file(&flat_path) {
                log::warn!("Failed to remove {:?}: {}", flat_path, e);
            }
        }
        result
    }
}

impl SortCodec for StringCodec {
    type Block = StringBlock;
    type Cursor = DictRunCursor;
    type Output = DictFlags;

    fn new_block(&self) -> StringBlock {
        StringBlock::with_capacity(self.options.block_bytes, self.options.block_items)
    }

    fn write_run(&self, block: &mut StringBlock, path: &Path) -> Result<()> {
        block.sort_dedup();
        Self::write_block(block, path, DictFlags::empty())
    }

    fn open_run(&self, path: &Path) -> Result<DictRunCursor> {
        DictRunCursor::open(path)
    }

    fn load_run(&self, path: &Path, block: &mut StringBlock) -> Result<()> {
        let dict = Dict::open(path)?;
        for entry in dict.iter() {
            if !block.push(entry?) {
                return Err(Error::invalid_state(format!("run {:?} does not fit in one block", path)));
            }
        }
        Ok(())
    }

    fn write_output(&self, block: &mut StringBlock, dest: &Path, flags: &DictFlags) -> Result<()> {
        block.sort_dedup();
        Self::write_layout(dest, *flags, |path, flags| Self::write_block(block, path, flags))
    }

    fn merge_output(
        &self,
        merge: KWayMerge<DictRunCursor>,
        dest: &Path,
        flags: &DictFlags,
    ) -> Result<()> {
        let mut count = 0;
        let mut bytes = 0;
        for cursor in merge.cursors() {
            count += cursor.dict.len();
            bytes += cursor.dict.payload_len()?;
        }

        Self::write_layout(dest, *flags, |path, flags| {
            let writer = DictWriter::create(path, count, bytes, flags)?;
            let mut last: Option<Vec<u8>> = None;
            merge.for_each(|term| {
                if last.as_deref() == Some(term) {
                    return Ok(());
                }
                writer.write_sorted(term)?;
                let buf = last.get_or_insert_with(Vec::new);
                buf.clear();
                buf.extend_from_slice(term);
                Ok(())
            })?;
            let written = writer.count()?;
            writer.close()?;

            log::info!("Merged {} distinct strings into {:?}", written, path);
            Ok(())
        })
    }

    fn adopt_run(&self, run: &Path, dest: &Path, flags: &DictFlags) -> Result<bool> {
        Self::write_layout(dest, *flags, |path, flags| {
            if fs::rename(run, path).is_err() {
                fs::copy(run, path)?;
                if let Err(e) = fs::remove_file(run) {
                    log::warn!("Failed to remove run {:?}: {}", run, e);
                }
            }
            patch_flags(path, flags)
        })?;
        Ok(true)
    }
}

/// Sorts unordered strings into a dictionary file.
///
/// Usage:
/// ```no_run
/// use termstore::config::SortOptions;
/// use termstore::dict::DictFlags;
/// use termstore::sort::DictSorter;
///
/// let sorter = DictSorter::new("terms", SortOptions::default()).unwrap();
/// sorter.add(b"<http://ex.org/b>").unwrap();
/// sorter.add(b"<http://ex.org/a>").unwrap();
/// let dict = sorter.finish("terms.dict".as_ref(), DictFlags::empty()).unwrap();
/// assert_eq!(dict.len(), 2);
/// ```
pub struct DictSorter {
    sorter: Sorter<StringCodec>,
}

impl DictSorter {
    /// Create a sorter; `name` labels its spill thread and run directory.
    pub fn new(name: &str, options: SortOptions) -> Result<Self> {
        let codec = StringCodec::new(options.clone());
        Ok(Self { sorter: Sorter::new(name, codec, options)? })
    }

    /// Add one string. Duplicates are removed by the sort.
    pub fn add(&self, term: &[u8]) -> Result<()> {
        self.sorter.add(term)
    }

    /// Blocks spilled so far.
    pub fn spill_count(&self) -> usize {
        self.sorter.spill_count()
    }

    /// Drain spills and return the runs without writing an output.
    pub fn finish_runs(self) -> Result<SortedRuns<StringCodec>> {
        self.sorter.finish()
    }

    /// Write the sorted, deduplicated strings to `dest` and open the result.
    ///
    /// With the locality flag set, a flat file is written first and then
    /// rearranged into tree order.
    pub fn finish(self, dest: &Path, flags: DictFlags) -> Result<Dict> {
        self.sorter.finish()?.into_output(dest, &flags)?;
        Dict::open(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_capacity() {
        let mut block = StringBlock::with_capacity(8, 3);
        assert!(block.push(b"abc"));
        assert!(block.push(b"defg"));
        assert!(!block.push(b"xy"));
        assert!(block.push(b"z"));
        assert!(!block.push(b""));
        assert_eq!(block.len(), 3);

        block.clear();
        assert!(block.is_empty());
        assert!(block.push(b"12345678"));
    }

    #[test]
    fn test_block_sort_dedup() {
        let mut block = StringBlock::with_capacity(64, 16);
        for s in [&b"pear"[..], b"apple", b"fig", b"apple", b"", b"fig"] {
            block.push(s);
        }
        block.sort_dedup();
        let sorted: Vec<&[u8]> = block.iter().collect();
        assert_eq!(sorted, vec![&b""[..], b"apple", b"fig", b"pear"]);
        assert_eq!(block.payload_len(), 12);
    }

    #[test]
    fn test_recent_contains_window() {
        let mut block = StringBlock::with_capacity(64, 16);
        for s in [&b"a"[..], b"b", b"c"] {
            block.push(s);
        }
        assert!(block.recent_contains(b"c", 1));
        assert!(!block.recent_contains(b"a", 2));
        assert!(block.recent_contains(b"a", 3));
        assert!(!block.recent_contains(b"a", 0));
    }
}
