//! Implicit-tree dictionary layout.
//!
//! Entries are stored so that file position `k` holds node `k + 1` of a
//! complete binary search tree whose node `i` has children `2i` and `2i + 1`.
//! Lookups walk from the root and touch one cache line per level near the top
//! of the tree instead of jumping across a flat array. Ids are still the
//! sorted ranks of the entries, so both layouts assign the same ids.

use crate::dict::writer::DictWriter;
use crate::dict::{Dict, DictFlags, TermLookup, TermSyntax, TermView};
use crate::error::{Error, Result};
use crate::{MIN_ID, NOT_FOUND};
use std::cmp::Ordering;
use std::path::Path;

/// Number of nodes in the subtree rooted at `node` for a tree of `n` nodes.
pub(crate) fn subtree_size(node: u64, n: u64) -> u64 {
    let (mut lo, mut hi) = (node, node);
    let mut size = 0;
    while lo <= n {
        size += hi.min(n) - lo + 1;
        lo = lo.saturating_mul(2);
        hi = hi.saturating_mul(2).saturating_add(1);
    }
    size
}

/// Sorted rank (0-based) of tree node `node` (1-based).
pub(crate) fn rank_of_node(node: u64, n: u64) -> u64 {
    let depth = 63 - node.leading_zeros();
    let mut current = 1;
    let mut rank = 0;
    for level in (0..depth).rev() {
        if (node >> level) & 1 == 0 {
            current *= 2;
        } else {
            rank += subtree_size(current * 2, n) + 1;
            current = current * 2 + 1;
        }
    }
    rank + subtree_size(node * 2, n)
}

/// Tree node (1-based) holding sorted rank `rank` (0-based, `rank < n`).
pub(crate) fn node_of_rank(rank: u64, n: u64) -> u64 {
    let mut node = 1;
    let mut rank = rank;
    loop {
        let left = subtree_size(node * 2, n);
        match rank.cmp(&left) {
            Ordering::Less => node *= 2,
            Ordering::Equal => return node,
            Ordering::Greater => {
                rank -= left + 1;
                node = node * 2 + 1;
            }
        }
    }
}

/// Tree-walking lookup over a locality-layout [`Dict`].
#[derive(Debug)]
pub struct LocalityLookup {
    dict: Dict,
    syntax: TermSyntax,
}

impl LocalityLookup {
    /// Wrap an opened dictionary. Validation expects complete terms.
    pub fn new(dict: Dict) -> Self {
        Self { dict, syntax: TermSyntax::Term }
    }

    /// Use `syntax` when validating entries.
    pub fn with_syntax(mut self, syntax: TermSyntax) -> Self {
        self.syntax = syntax;
        self
    }
}

impl TermLookup for LocalityLookup {
    fn find(&self, term: &[u8]) -> Result<u64> {
        let n = self.dict.len();
        let mut node = 1;
        while node <= n {
            match term.cmp(self.dict.entry(node - 1)?) {
                Ordering::Equal => return Ok(rank_of_node(node, n) + MIN_ID),
                Ordering::Less => node *= 2,
                Ordering::Greater => node = node * 2 + 1,
            }
        }
        Ok(NOT_FOUND)
    }

    fn get(&self, id: u64) -> Result<Option<TermView<'_>>> {
        if !self.dict.contains_id(id) {
            return Ok(None);
        }
        let node = node_of_rank(id - MIN_ID, self.dict.len());
        Ok(Some(TermView::single(self.dict.entry(node - 1)?)))
    }

    fn len(&self) -> u64 {
        self.dict.len()
    }

    fn validate(&self) -> Result<()> {
        self.dict.validate(self.syntax)
    }

    fn flags(&self) -> DictFlags {
        self.dict.flags()
    }

    fn close(&mut self) {
        self.dict.close();
    }
}

/// Rewrite a flat sorted dictionary into the locality layout at `dest`.
///
/// Each output position is filled with the entry of the matching sorted rank,
/// so the source is read in tree order and the output written sequentially.
pub fn relayout_locality<P: AsRef<Path>>(source: &Dict, dest: P) -> Result<Dict> {
    let flags = source.flags();
    if flags.contains(DictFlags::LOCALITY) {
        return Err(Error::invalid_argument("source dict already uses the locality layout"));
    }
    if flags.contains(DictFlags::SHARED_DICT) {
        return Err(Error::config("composite dicts cannot use the locality layout"));
    }

    let n = source.len();
    let writer = DictWriter::create(
        dest.as_ref(),
        n,
        source.payload_len()?,
        flags.with(DictFlags::LOCALITY, true),
    )?;
    for node in 1..=n {
        writer.write_sorted(source.entry(rank_of_node(node, n))?)?;
    }
    writer.close()?;

    log::info!("Wrote locality layout of {} entries to {:?}", n, dest.as_ref());
    Dict::open(dest)
}
