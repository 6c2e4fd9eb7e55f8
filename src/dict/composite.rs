//! Two-level dictionary whose entries reference a shared dictionary.
//!
//! Each composite entry is `[code][marker][local]`. The code names a shared
//! part by its id in the shared dictionary; `get` stitches the shared and
//! local slices together as a [`TermView`] without copying.
//!
//! Entries whose shared id did not fit the code are stored under the sentinel
//! code with the full term as the local part. Files containing such entries
//! carry the `SHARED_OVERFLOW` flag, and `find` retries under the sentinel
//! when the regular key misses.

use crate::config::MAX_SHARED_ID;
use crate::dict::splitter::{
    composite_key, decode_shared_id, encode_shared_id, SENTINEL_SHARED_ID, CODE_LEN,
};
use crate::dict::{
    flat_position, position_to_id, Dict, DictFlags, SharedSide, SplitMode, Splitter, TermLookup,
    TermSyntax, TermView,
};
use crate::error::{Error, Result};
use crate::{MIN_ID, NOT_FOUND};
use std::sync::Arc;

/// Lookup over a composite [`Dict`] and its shared dictionary.
pub struct CompositeLookup {
    dict: Dict,
    shared: Arc<dyn TermLookup>,
    splitter: Splitter,
    overflow: bool,
    shared_id_limit: u64,
}

impl std::fmt::Debug for CompositeLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeLookup")
            .field("dict", &self.dict)
            .field("shared_len", &self.shared.len())
            .field("overflow", &self.overflow)
            .field("shared_id_limit", &self.shared_id_limit)
            .finish()
    }
}

impl CompositeLookup {
    /// Pair a composite dictionary with its shared dictionary.
    ///
    /// Fails with a configuration error when the header declares shared-dict
    /// use but `shared` is missing, when the header does not declare it, or
    /// when id 1 of the shared dictionary is not the empty string.
    pub fn new(dict: Dict, shared: Option<Arc<dyn TermLookup>>) -> Result<Self> {
        let flags = dict.flags();
        if !flags.contains(DictFlags::SHARED_DICT) {
            return Err(Error::config(format!(
                "{:?} does not declare a shared dict",
                dict.path()
            )));
        }
        if flags.contains(DictFlags::LOCALITY) {
            return Err(Error::config("composite dicts must use the flat layout"));
        }
        let shared = shared.ok_or_else(|| {
            Error::config(format!("{:?} requires a shared dict but none was given", dict.path()))
        })?;
        match shared.get(SENTINEL_SHARED_ID)? {
            Some(view) if view.is_empty() => {}
            _ => {
                return Err(Error::config(
                    "shared dict must hold the empty string as its first entry",
                ))
            }
        }

        let mode = if flags.contains(DictFlags::PREFIX_ONLY) {
            SplitMode::PrefixOnly
        } else {
            SplitMode::PrefixAndSuffix
        };
        Ok(Self {
            dict,
            shared,
            splitter: Splitter::new(mode),
            overflow: flags.contains(DictFlags::SHARED_OVERFLOW),
            shared_id_limit: MAX_SHARED_ID,
        })
    }

    /// Skip the coded search for shared ids above `limit`.
    ///
    /// The builder stores every term whose shared id exceeds its configured
    /// limit under the sentinel code, so the coded key cannot exist. Without
    /// this hint the codable maximum is assumed.
    pub fn with_shared_id_limit(mut self, limit: u64) -> Self {
        self.shared_id_limit = limit.min(MAX_SHARED_ID);
        self
    }

    /// Largest shared id looked up under its own code.
    pub fn shared_id_limit(&self) -> u64 {
        self.shared_id_limit
    }

    /// The shared dictionary.
    pub fn shared(&self) -> &Arc<dyn TermLookup> {
        &self.shared
    }

    /// The composite dictionary file.
    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    /// Whether the file holds entries stored under the overflow sentinel.
    pub fn has_overflow(&self) -> bool {
        self.overflow
    }

    fn search(&self, code: [u8; CODE_LEN], local: &[u8], key: &mut Vec<u8>) -> Result<u64> {
        composite_key(code, local, key);
        Ok(position_to_id(self.dict.search(key)?))
    }

    fn search_unshared(&self, term: &[u8], key: &mut Vec<u8>) -> Result<u64> {
        self.search(encode_shared_id(SENTINEL_SHARED_ID, SharedSide::None), term, key)
    }

    /// Decode the entry at `position` into its shared id, side and local bytes.
    fn decode(&self, position: u64) -> Result<(u64, SharedSide, &[u8])> {
        let raw = self.dict.entry(position)?;
        let (shared_id, side) = decode_shared_id(raw)?;
        Ok((shared_id, side, &raw[CODE_LEN..]))
    }
}

impl TermLookup for CompositeLookup {
    fn find(&self, term: &[u8]) -> Result<u64> {
        let split = self.splitter.split(term);
        let mut key = Vec::with_capacity(term.len() + CODE_LEN);

        if split.side == SharedSide::None {
            return self.search_unshared(term, &mut key);
        }

        let shared_id = self.shared.find(&split.shared)?;
        if shared_id != NOT_FOUND && shared_id <= self.shared_id_limit {
            let id = self.search(encode_shared_id(shared_id, split.side), &split.local, &mut key)?;
            if id != NOT_FOUND {
                return Ok(id);
            }
        }
        if self.overflow {
            return self.search_unshared(term, &mut key);
        }
        Ok(NOT_FOUND)
    }

    fn get(&self, id: u64) -> Result<Option<TermView<'_>>> {
        let Some(position) = flat_position(&self.dict, id) else {
            return Ok(None);
        };
        let (shared_id, side, local) = self.decode(position)?;
        let shared = self
            .shared
            .get(shared_id)?
            .ok_or_else(|| {
                Error::corruption(format!(
                    "composite id {} references missing shared id {}",
                    id, shared_id
                ))
            })?
            .as_single()
            .ok_or_else(|| Error::corruption("shared dict returned a split term"))?;

        Ok(Some(match side {
            SharedSide::Suffix => TermView::pair(local, shared),
            SharedSide::Prefix | SharedSide::None => TermView::pair(shared, local),
        }))
    }

    fn len(&self) -> u64 {
        self.dict.len()
    }

    /// Check the file structure, every code, and every reconstructed term.
    fn validate(&self) -> Result<()> {
        self.dict.validate(TermSyntax::Any)?;
        for id in MIN_ID..MIN_ID + self.dict.len() {
            let (shared_id, _, _) = self.decode(id - MIN_ID)?;
            if shared_id < MIN_ID || shared_id > self.shared.len() {
                return Err(Error::corruption(format!(
                    "composite id {} references shared id {} beyond {} shared entries",
                    id,
                    shared_id,
                    self.shared.len()
                )));
            }
            let term = self
                .get(id)?
                .ok_or_else(|| Error::corruption(format!("composite id {} not readable", id)))?
                .to_vec();
            if !TermSyntax::Term.accepts(&term) {
                return Err(Error::corruption(format!(
                    "composite id {} reconstructs to malformed term {:?}",
                    id,
                    String::from_utf8_lossy(&term)
                )));
            }
        }
        Ok(())
    }

    fn flags(&self) -> DictFlags {
        self.dict.flags()
    }

    /// Unmap the composite file, and the shared one unless another owner
    /// still holds it.
    fn close(&mut self) {
        self.dict.close();
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.close(),
            None => log::debug!("Shared dict of {:?} is still in use", self.dict.path()),
        }
    }
}
