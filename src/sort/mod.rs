//! External sort engine.
//!
//! Items are appended to a fixed-capacity staging block. When the block is
//! full it is handed to a background thread that sorts it and persists it as
//! a run file, while the caller keeps filling a fresh block. On `finish` the
//! in-flight spill is drained and the result is either:
//!
//! - written straight from the resident block (nothing was spilled),
//! - adopted from the single run file (one spill, nothing resident), or
//! - produced by a k-way merge over all runs.
//!
//! ## Process
//!
//! 1. `Sorter::add` appends, dropping items equal to one of the last few
//! 2. Full blocks (item capacity reached, or the next item does not fit) go through a zero-capacity channel to the spill worker (worker.rs)
//! 3. `Sorter::finish` drains the worker and returns `SortedRuns`
//! 4. `SortedRuns` writes the final output, merging runs if needed (merge.rs)
//!
//! Formats plug in through [`SortCodec`]: string dictionaries (strings.rs)
//! and triple indices (`crate::triples::sorter`).

pub mod merge;
pub mod strings;
mod worker;

pub use merge::KWayMerge;
pub use strings::{DictSorter, StringBlock, StringCodec};

use crate::config::SortOptions;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use worker::SpillWorker;

/// A fixed-capacity staging buffer.
pub trait SortBlock: Send + 'static {
    /// The item type appended to the block.
    type Item: ?Sized;

    /// Append `item`. Returns `false`, leaving the block unchanged, when full.
    fn push(&mut self, item: &Self::Item) -> bool;

    /// Whether `item` equals one of the last `window` items appended.
    fn recent_contains(&self, item: &Self::Item, window: usize) -> bool;

    /// Whether the item capacity is reached.
    fn is_full(&self) -> bool;

    /// Number of items held.
    fn len(&self) -> usize;

    /// Whether the block holds no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all items, keeping the allocation.
    fn clear(&mut self);
}

/// Reads one sorted run file in order.
pub trait RunCursor {
    /// The key compared during merging.
    type Key: Ord + ?Sized;

    /// The current key, or `None` when the run is exhausted.
    fn peek(&self) -> Option<&Self::Key>;

    /// Move to the next key.
    fn advance(&mut self) -> Result<()>;
}

/// Format hooks used by the sort engine.
pub trait SortCodec: Send + Sync + 'static {
    /// Staging buffer type.
    type Block: SortBlock;
    /// Cursor over a run file.
    type Cursor: RunCursor;
    /// Extra settings applied to the final output only.
    type Output;

    /// Allocate an empty staging block.
    fn new_block(&self) -> Self::Block;

    /// Sort `block` in place and persist it as a run file at `path`.
    fn write_run(&self, block: &mut Self::Block, path: &Path) -> Result<()>;

    /// Open a run file for merging.
    fn open_run(&self, path: &Path) -> Result<Self::Cursor>;

    /// Load a run file back into `block` (which is empty).
    fn load_run(&self, path: &Path, block: &mut Self::Block) -> Result<()>;

    /// Sort `block` and write it as the final output.
    fn write_output(&self, block: &mut Self::Block, dest: &Path, output: &Self::Output)
        -> Result<()>;

    /// Stream a merge of runs into the final output.
    fn merge_output(
        &self,
        merge: KWayMerge<Self::Cursor>,
        dest: &Path,
        output: &Self::Output,
    ) -> Result<()>;

    /// Turn a single run file into the final output by moving it.
    ///
    /// Returns `false` when the run format differs from the output format.
    fn adopt_run(&self, run: &Path, dest: &Path, output: &Self::Output) -> Result<bool>;
}

/// Temporary directory for run files; removal failures are logged.
struct RunDir {
    dir: Option<TempDir>,
}

impl RunDir {
    fn create(options: &SortOptions, name: &str) -> Result<Self> {
        let prefix = format!("{}-runs-", name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &options.temp_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir: Some(dir) })
    }

    fn run_path(&self, index: usize) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.path().join(format!("run-{:06}", index)),
            None => PathBuf::from(format!("run-{:06}", index)),
        }
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove run directory {:?}: {}", path, e);
            }
        }
    }
}

struct SortState<C: SortCodec> {
    filling: C::Block,
    worker: Option<SpillWorker<C::Block>>,
    runs: Vec<PathBuf>,
    dir: RunDir,
    added: u64,
}

/// External sorter over a [`SortCodec`].
///
/// `add` takes `&self` so the sorter can be shared, but it is a single-writer
/// component: a call that overlaps another fails with [`Error::ConcurrentUse`].
pub struct Sorter<C: SortCodec> {
    name: String,
    codec: Arc<C>,
    options: SortOptions,
    state: Mutex<SortState<C>>,
}

impl<C: SortCodec> Sorter<C> {
    /// Create a sorter. `name` labels the spill thread and run directory.
    pub fn new(name: &str, codec: C, options: SortOptions) -> Result<Self> {
        options.validate()?;
        let dir = RunDir::create(&options, name)?;
        let filling = codec.new_block();
        Ok(Self {
            name: name.to_string(),
            codec: Arc::new(codec),
            options,
            state: Mutex::new(SortState { filling, worker: None, runs: Vec::new(), dir, added: 0 }),
        })
    }

    /// The codec in use.
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Append one item.
    pub fn add(&self, item: &<C::Block as SortBlock>::Item) -> Result<()> {
        let mut state = self
            .state
            .try_lock()
            .ok_or_else(|| Error::concurrent_use(format!("sorter {} is busy", self.name)))?;

        let window = self.options.dedup_window;
        if window > 0 && state.filling.recent_contains(item, window) {
            return Ok(());
        }
        if !state.filling.push(item) {
            if !state.filling.is_empty() {
                self.spill(&mut state)?;
            }
            if !state.filling.push(item) {
                return Err(Error::invalid_argument(format!(
                    "item does not fit in an empty {} block",
                    self.name
                )));
            }
        }
        state.added += 1;
        if state.filling.is_full() {
            self.spill(&mut state)?;
        }
        Ok(())
    }

    fn spill(&self, state: &mut SortState<C>) -> Result<()> {
        if state.worker.is_none() {
            state.worker = Some(SpillWorker::spawn(&self.name, Arc::clone(&self.codec))?);
        }
        let path = state.dir.run_path(state.runs.len());
        let Some(worker) = state.worker.as_ref() else {
            return Err(Error::invalid_state("spill worker missing"));
        };
        let fresh = worker.take_recycled().unwrap_or_else(|| self.codec.new_block());
        let full = std::mem::replace(&mut state.filling, fresh);

        log::debug!("{}: spilling block of {} items to {:?}", self.name, full.len(), path);
        worker.submit(full, path.clone())?;
        state.runs.push(path);
        Ok(())
    }

    /// Items accepted so far (after immediate-duplicate suppression).
    pub fn added(&self) -> u64 {
        self.state.lock().added
    }

    /// Blocks handed to the spill worker so far.
    pub fn spill_count(&self) -> usize {
        self.state.lock().runs.len()
    }

    /// Drain the spill worker and hand over the runs.
    ///
    /// Failures captured by the worker are raised here.
    pub fn finish(self) -> Result<SortedRuns<C>> {
        let mut state = self.state.into_inner();
        if let Some(worker) = state.worker.take() {
            worker.finish()?;
        }
        log::info!(
            "{}: sorted {} items into {} run(s) plus {} resident",
            self.name,
            state.added,
            state.runs.len(),
            state.filling.len()
        );
        Ok(SortedRuns {
            name: self.name,
            codec: self.codec,
            dir: state.dir,
            runs: state.runs,
            resident: state.filling,
        })
    }
}

/// Sorted runs left by a finished [`Sorter`].
///
/// Runs stay on disk until this value is dropped, so they can be rewritten
/// and merged again (the triple sorter does this once per permutation).
pub struct SortedRuns<C: SortCodec> {
    name: String,
    codec: Arc<C>,
    dir: RunDir,
    runs: Vec<PathBuf>,
    resident: C::Block,
}

impl<C: SortCodec> SortedRuns<C> {
    /// Number of run files.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Items still held in memory.
    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    /// Write the final output to `dest`, keeping the runs for reuse.
    ///
    /// A non-empty resident block is persisted as one more run before merging.
    pub fn write_output(&mut self, dest: &Path, output: &C::Output) -> Result<()> {
        if self.runs.is_empty() {
            log::info!("{}: writing {} items to {:?}", self.name, self.resident.len(), dest);
            return self.codec.write_output(&mut self.resident, dest, output);
        }

        if !self.resident.is_empty() {
            let path = self.dir.run_path(self.runs.len());
            self.codec.write_run(&mut self.resident, &path)?;
            self.resident.clear();
            self.runs.push(path);
        }

        log::info!("{}: merging {} runs into {:?}", self.name, self.runs.len(), dest);
        let cursors = self
            .runs
            .iter()
            .map(|path| self.codec.open_run(path))
            .collect::<Result<Vec<_>>>()?;
        self.codec.merge_output(KWayMerge::new(cursors), dest, output)
    }

    /// Write the final output to `dest`, consuming the runs.
    ///
    /// A single run with nothing resident is moved into place when its format
    /// allows it.
    pub fn into_output(mut self, dest: &Path, output: &C::Output) -> Result<()> {
        if self.runs.len() == 1 && self.resident.is_empty() {
            if self.codec.adopt_run(&self.runs[0], dest, output)? {
                log::info!("{}: adopted single run as {:?}", self.name, dest);
                self.runs.clear();
                return Ok(());
            }
        }
        self.write_output(dest, output)
    }

    /// Apply `f` to every item set and re-sort it in place.
    ///
    /// Each run file is loaded into one scratch block, transformed, sorted and
    /// rewritten over itself; the resident block is transformed in memory.
    pub fn resort_with<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&mut C::Block),
    {
        f(&mut self.resident);
        if self.runs.is_empty() {
            return Ok(());
        }
        let mut scratch = self.codec.new_block();
        for path in &self.runs {
            scratch.clear();
            self.codec.load_run(path, &mut scratch)?;
            f(&mut scratch);
            self.codec.write_run(&mut scratch, path)?;
        }
        log::debug!("{}: re-sorted {} runs", self.name, self.runs.len());
        Ok(())
    }
}
