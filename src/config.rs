//! Configuration options for the build pipeline.

use crate::dict::splitter::SplitMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest shared id that fits the 4-character code.
pub const MAX_SHARED_ID: u64 = (1 << 24) - 1;

/// Options for an external sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOptions {
    /// Payload capacity of one staging block (in bytes).
    /// Default: 64MB
    pub block_bytes: usize,

    /// Maximum number of items in one staging block.
    /// Default: 4M
    pub block_items: usize,

    /// Number of most recent items checked for immediate duplicates.
    /// Set to 0 to disable the check.
    /// Default: 4
    pub dedup_window: usize,

    /// Directory for temporary run files. Uses the system temp dir when unset.
    /// Default: None
    pub temp_dir: Option<PathBuf>,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            block_bytes: 64 * 1024 * 1024, // 64MB
            block_items: 4 * 1024 * 1024,
            dedup_window: 4,
            temp_dir: None,
        }
    }
}

impl SortOptions {
    /// Creates a new SortOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block payload capacity.
    pub fn block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes;
        self
    }

    /// Sets the block item capacity.
    pub fn block_items(mut self, items: usize) -> Self {
        self.block_items = items;
        self
    }

    /// Sets the duplicate check window.
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    /// Sets the directory for run files.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_items == 0 {
            return Err(crate::Error::invalid_argument("block_items must be > 0"));
        }
        if self.block_bytes == 0 {
            return Err(crate::Error::invalid_argument("block_bytes must be > 0"));
        }
        if self.block_bytes > u32::MAX as usize {
            return Err(crate::Error::invalid_argument("block_bytes must fit in 32 bits"));
        }
        Ok(())
    }
}

/// Options for building a shared + composite dictionary pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeOptions {
    /// Sort settings used by both passes.
    pub sort: SortOptions,

    /// Which terms are split into shared and local parts.
    /// Default: SplitMode::PrefixAndSuffix
    pub split_mode: SplitMode,

    /// Largest shared id stored as a code; larger ids overflow to the sentinel.
    /// Default: 2^24 - 1
    pub shared_id_limit: u64,

    /// Run a full validation of both files after writing.
    /// Default: true
    pub validate: bool,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            sort: SortOptions::default(),
            split_mode: SplitMode::PrefixAndSuffix,
            shared_id_limit: MAX_SHARED_ID,
            validate: true,
        }
    }
}

impl CompositeOptions {
    /// Creates a new CompositeOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sort settings.
    pub fn sort(mut self, sort: SortOptions) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the split mode.
    pub fn split_mode(mut self, mode: SplitMode) -> Self {
        self.split_mode = mode;
        self
    }

    /// Sets the shared id limit.
    pub fn shared_id_limit(mut self, limit: u64) -> Self {
        self.shared_id_limit = limit;
        self
    }

    /// Enables or disables post-build validation.
    pub fn validate_output(mut self, value: bool) -> Self {
        self.validate = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        self.sort.validate()?;
        if self.shared_id_limit < crate::MIN_ID || self.shared_id_limit > MAX_SHARED_ID {
            return Err(crate::Error::invalid_argument(format!(
                "shared_id_limit must be in [1, {}]",
                MAX_SHARED_ID
            )));
        }
        Ok(())
    }
}

/// Options for building triple permutation indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriplesOptions {
    /// Sort settings; `block_bytes` is ignored, triples are sized by `block_items`.
    pub sort: SortOptions,
}

impl TriplesOptions {
    /// Creates a new TriplesOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sort settings.
    pub fn sort(mut self, sort: SortOptions) -> Self {
        self.sort = sort;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        self.sort.validate()
    }
}
