//! Triple sorting into the three permutation indices.
//!
//! Triples are sorted once in SPO order. Each later permutation rewrites the
//! stored runs in place (a shuffle) instead of rescanning the input.
//!
//! ## Run Format
//!
//! ```text
//! [Record: 24B]*     // (key, sub_key, value) as little-endian u64
//! ```

use crate::config::TriplesOptions;
use crate::error::{Error, Result};
use crate::sort::{KWayMerge, RunCursor, SortBlock, SortCodec, Sorter};
use crate::triples::{IdWidth, Permutation, TripleIndex, TriplesWriter};
use bytes::{Buf, BufMut, BytesMut};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const RECORD_SIZE: usize = 24;

fn decode_record(mut bytes: &[u8]) -> [u64; 3] {
    [bytes.get_u64_le(), bytes.get_u64_le(), bytes.get_u64_le()]
}

/// Staging block of `(key, sub_key, value)` records.
pub struct TripleBlock {
    records: Vec<[u64; 3]>,
    max_items: usize,
}

impl TripleBlock {
    /// Allocate a block holding up to `max_items` records.
    pub fn with_capacity(max_items: usize) -> Self {
        Self { records: Vec::with_capacity(max_items), max_items }
    }

    /// Records in their current order.
    pub fn records(&self) -> &[[u64; 3]] {
        &self.records
    }

    /// Rewrite every record with `f`. Order is not restored.
    pub fn map_records<F>(&mut self, f: F)
    where
        F: Fn([u64; 3]) -> [u64; 3],
    {
        for record in &mut self.records {
            *record = f(*record);
        }
    }

    /// Sort records and drop duplicates.
    pub fn sort_dedup(&mut self) {
        self.records.sort_unstable();
        self.records.dedup();
    }
}

impl SortBlock for TripleBlock {
    type Item = [u64; 3];

    fn push(&mut self, item: &[u64; 3]) -> bool {
        if self.records.len() >= self.max_items {
            return false;
        }
        self.records.push(*item);
        true
    }

    fn recent_contains(&self, item: &[u64; 3], window: usize) -> bool {
        let first = self.records.len().saturating_sub(window);
        self.records[first..].contains(item)
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.max_items
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Cursor over a mapped run of raw records.
pub struct TripleRunCursor {
    mmap: Mmap,
    pos: usize,
    current: Option<[u64; 3]>,
}

impl TripleRunCursor {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() % RECORD_SIZE != 0 {
            return Err(Error::corruption(format!(
                "run {:?} is {} bytes, not a multiple of {}",
                path,
                mmap.len(),
                RECORD_SIZE
            )));
        }
        let mut cursor = Self { mmap, pos: 0, current: None };
        cursor.advance()?;
        Ok(cursor)
    }

    fn records(&self) -> usize {
        self.mmap.len() / RECORD_SIZE
    }
}

impl RunCursor for TripleRunCursor {
    type Key = [u64; 3];

    fn peek(&self) -> Option<&[u64; 3]> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<()> {
        if self.pos + RECORD_SIZE > self.mmap.len() {
            self.current = None;
            return Ok(());
        }
        self.current = Some(decode_record(&self.mmap[self.pos..self.pos + RECORD_SIZE]));
        self.pos += RECORD_SIZE;
        Ok(())
    }
}

/// [`SortCodec`] producing permutation index files.
#[derive(Debug, Clone)]
pub struct TripleCodec {
    options: TriplesOptions,
}

impl TripleCodec {
    /// Codec sizing its blocks from `options`.
    pub fn new(options: TriplesOptions) -> Self {
        Self { options }
    }
}

impl SortCodec for TripleCodec {
    type Block = TripleBlock;
    type Cursor = TripleRunCursor;
    type Output = IdWidth;

    fn new_block(&self) -> TripleBlock {
        TripleBlock::with_capacity(self.options.sort.block_items)
    }

    fn write_run(&self, block: &mut TripleBlock, path: &Path) -> Result<()> {
        block.sort_dedup();
        let mut out = BufWriter::new(File::create(path)?);
        let mut buf = BytesMut::with_capacity(RECORD_SIZE);
        for record in block.records() {
            buf.clear();
            for id in record {
                buf.put_u64_le(*id);
            }
            out.write_all(&buf)?;
        }
        out.flush()?;
        Ok(())
    }

    fn open_run(&self, path: &Path) -> Result<TripleRunCursor> {
        TripleRunCursor::open(path)
    }

    fn load_run(&self, path: &Path, block: &mut TripleBlock) -> Result<()> {
        let bytes = fs::read(path)?;
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(Error::corruption(format!("run {:?} has a partial record", path)));
        }
        for chunk in bytes.chunks_exact(RECORD_SIZE) {
            if !block.push(&decode_record(chunk)) {
                return Err(Error::invalid_state(format!("run {:?} does not fit in one block", path)));
            }
        }
        Ok(())
    }

    fn write_output(&self, block: &mut TripleBlock, dest: &Path, width: &IdWidth) -> Result<()> {
        block.sort_dedup();
        let mut writer = TriplesWriter::create(dest, *width)?;
        for &[k, sk, v] in block.records() {
            writer.add(k, sk, v)?;
        }
        writer.finish()?;
        Ok(())
    }

    fn merge_output(
        &self,
        merge: KWayMerge<TripleRunCursor>,
        dest: &Path,
        width: &IdWidth,
    ) -> Result<()> {
        let total: usize = merge.cursors().iter().map(|c| c.records()).sum();
        let mut writer = TriplesWriter::create(dest, *width)?;
        let mut last = None;
        let mut written = 0u64;
        merge.for_each(|record| {
            if last == Some(*record) {
                return Ok(());
            }
            let [k, sk, v] = *record;
            writer.add(k, sk, v)?;
            last = Some(*record);
            written += 1;
            Ok(())
        })?;
        writer.finish()?;

        log::info!("Merged {} of {} records into {:?}", written, total, dest);
        Ok(())
    }

    fn adopt_run(&self, _run: &Path, _dest: &Path, _width: &IdWidth) -> Result<bool> {
        // runs are raw records, never the index format
        Ok(false)
    }
}

/// Sorts unordered `(s, p, o)` triples into SPO, PSO and OPS indices.
///
/// Usage:
/// ```no_run
/// use termstore::config::TriplesOptions;
/// use termstore::triples::TriplesSorter;
///
/// let sorter = TriplesSorter::new("triples", TriplesOptions::default()).unwrap();
/// sorter.add(1, 2, 3).unwrap();
/// sorter.add(2, 1, 1).unwrap();
/// let index = sorter.finish("index".as_ref()).unwrap();
/// assert!(index.contains(1, 2, 3).unwrap());
/// ```
pub struct TriplesSorter {
    sorter: Sorter<TripleCodec>,
    max_id: AtomicU64,
}

impl TriplesSorter {
    /// Create a sorter; `name` labels its spill thread and run directory.
    pub fn new(name: &str, options: TriplesOptions) -> Result<Self> {
        options.validate()?;
        let sort = options.sort.clone();
        Ok(Self { sorter: Sorter::new(name, TripleCodec::new(options), sort)?, max_id: AtomicU64::new(0) })
    }

    /// Add one triple. Ids must be non-zero.
    pub fn add(&self, s: u64, p: u64, o: u64) -> Result<()> {
        if s == 0 || p == 0 || o == 0 {
            return Err(Error::invalid_argument(format!("id 0 is not valid: ({}, {}, {})", s, p, o)));
        }
        self.sorter.add(&[s, p, o])?;
        self.max_id.fetch_max(s.max(p).max(o), Ordering::Relaxed);
        Ok(())
    }

    /// Blocks spilled so far.
    pub fn spill_count(&self) -> usize {
        self.sorter.spill_count()
    }

    /// Write `spo.idx`, `pso.idx` and `ops.idx` into `dir` and open them.
    pub fn finish(self, dir: &Path) -> Result<TripleIndex> {
        fs::create_dir_all(dir)?;
        let width = IdWidth::for_max(self.max_id.load(Ordering::Relaxed));
        let mut runs = self.sorter.finish()?;

        let mut prev = Permutation::Spo;
        for permutation in Permutation::ALL {
            if permutation != prev {
                runs.resort_with(|block| block.map_records(|r| prev.shuffle(permutation, r)))?;
            }
            runs.write_output(&dir.join(permutation.file_name()), &width)?;
            prev = permutation;
        }

        log::info!("Wrote triple indices to {:?} ({}-byte ids)", dir, width.bytes());
        TripleIndex::open(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortOptions;
    use tempfile::TempDir;

    fn small_options(items: usize) -> TriplesOptions {
        TriplesOptions::new().sort(SortOptions::new().block_items(items))
    }

    #[test]
    fn test_block_map_and_sort() {
        let mut block = TripleBlock::with_capacity(4);
        for r in [[3, 1, 1], [1, 2, 3], [1, 2, 3], [2, 9, 9]] {
            assert!(block.push(&r));
        }
        assert!(!block.push(&[5, 5, 5]));

        block.map_records(|r| Permutation::Spo.shuffle(Permutation::Ops, r));
        block.sort_dedup();
        assert_eq!(block.records(), &[[1, 1, 3], [3, 2, 1], [9, 9, 2]]);
    }

    #[test]
    fn test_single_block_no_spill() {
        let dir = TempDir::new().unwrap();
        let sorter = TriplesSorter::new("t", TriplesOptions::default()).unwrap();
        for (s, p, o) in [(2, 1, 1), (1, 2, 4), (1, 2, 3)] {
            sorter.add(s, p, o).unwrap();
        }
        assert_eq!(sorter.spill_count(), 0);
        let index = sorter.finish(dir.path()).unwrap();

        let spo = index.get(Permutation::Spo);
        assert_eq!(spo.pairs(1).unwrap().collect::<Vec<_>>(), vec![(2, 3), (2, 4)]);
        assert_eq!(spo.pairs(2).unwrap().collect::<Vec<_>>(), vec![(1, 1)]);

        let pso = index.get(Permutation::Pso);
        assert_eq!(pso.pairs(2).unwrap().collect::<Vec<_>>(), vec![(1, 3), (1, 4)]);

        let ops = index.get(Permutation::Ops);
        assert_eq!(ops.pairs(1).unwrap().collect::<Vec<_>>(), vec![(1, 2)]);
        assert_eq!(ops.sub_keys(4, 1).unwrap().collect::<Vec<_>>(), vec![2]);
        index.validate().unwrap();
    }

    #[test]
    fn test_spilled_runs_are_shuffled() {
        let dir = TempDir::new().unwrap();
        let sorter = TriplesSorter::new("t", small_options(3)).unwrap();
        let mut triples = Vec::new();
        for s in 1..=4u64 {
            for o in 1..=3u64 {
                triples.push([s, 5 - s, o]);
            }
        }
        for &[s, p, o] in triples.iter().rev() {
            sorter.add(s, p, o).unwrap();
        }
        assert!(sorter.spill_count() >= 3);

        let index = sorter.finish(dir.path()).unwrap();
        index.validate().unwrap();
        for &[s, p, o] in &triples {
            assert!(index.contains(s, p, o).unwrap());
            assert!(index.get(Permutation::Pso).contains(p, s, o).unwrap());
            assert!(index.get(Permutation::Ops).contains(o, p, s).unwrap());
        }
        assert_eq!(index.get(Permutation::Ops).pair_count().unwrap(), 12);
    }

    #[test]
    fn test_rejects_zero_id() {
        let sorter = TriplesSorter::new("t", TriplesOptions::default()).unwrap();
        assert!(matches!(sorter.add(1, 0, 1), Err(Error::InvalidArgument(_))));
    }
}
