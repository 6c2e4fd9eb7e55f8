//! Triple permutation indices.
//!
//! Each index groups triples by one coordinate (the key) and stores, per key,
//! the ascending `(sub_key, value)` pairs of the other two.
//!
//! ## File Format
//!
//! ```text
//! [Header: 8B]       // key count (low 56 bits) | flags (top byte)
//! [First Key: 8B]    // keys are contiguous from this id
//! [Offsets Table]    // key count + 1 entries, byte offsets into the pair area
//! [Padding]          // to an 8-byte boundary
//! [Pair Area]        // per key: [sub_key][value] pairs at the id width
//! ```
//!
//! Keys in the contiguous range that own no triples have an empty run.
//! Id zero is never valid.

pub mod reader;
pub mod sorter;
pub mod writer;

pub use reader::{PairCursor, SubKeyCursor, Triples, ValueCursor};
pub use sorter::{TripleBlock, TripleCodec, TriplesSorter};
pub use writer::TriplesWriter;

use crate::error::{Error, Result};
use std::path::Path;

/// Size of the header (count word + first key).
pub const TRIPLES_HEADER_SIZE: u64 = 16;

/// Ids are 8 bytes wide instead of 4.
pub const FLAG_IDS_8: u8 = 1 << 0;
/// Offsets are 8 bytes wide instead of 4.
pub const FLAG_OFFSETS_8: u8 = 1 << 1;

/// Width of stored ids, chosen per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdWidth {
    /// 4-byte ids.
    Four,
    /// 8-byte ids.
    Eight,
}

impl IdWidth {
    /// The narrowest width holding `max_id`.
    pub fn for_max(max_id: u64) -> Self {
        if max_id > u32::MAX as u64 {
            IdWidth::Eight
        } else {
            IdWidth::Four
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            IdWidth::Four => 4,
            IdWidth::Eight => 8,
        }
    }
}

/// Coordinate order of a permutation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permutation {
    /// Keyed by subject: `(s, p, o)`.
    Spo,
    /// Keyed by predicate: `(p, s, o)`.
    Pso,
    /// Keyed by object: `(o, p, s)`.
    Ops,
}

impl Permutation {
    /// All permutations in build order.
    pub const ALL: [Permutation; 3] = [Permutation::Spo, Permutation::Pso, Permutation::Ops];

    /// Reorder an `(s, p, o)` triple into `(key, sub_key, value)`.
    pub fn from_spo(self, [s, p, o]: [u64; 3]) -> [u64; 3] {
        match self {
            Permutation::Spo => [s, p, o],
            Permutation::Pso => [p, s, o],
            Permutation::Ops => [o, p, s],
        }
    }

    /// Reorder a `(key, sub_key, value)` record back into `(s, p, o)`.
    pub fn to_spo(self, [k, sk, v]: [u64; 3]) -> [u64; 3] {
        match self {
            Permutation::Spo => [k, sk, v],
            Permutation::Pso => [sk, k, v],
            Permutation::Ops => [v, sk, k],
        }
    }

    /// Rewrite a record of this permutation into `next`'s order.
    pub fn shuffle(self, next: Permutation, record: [u64; 3]) -> [u64; 3] {
        next.from_spo(self.to_spo(record))
    }

    /// File name used inside an index directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Permutation::Spo => "spo.idx",
            Permutation::Pso => "pso.idx",
            Permutation::Ops => "ops.idx",
        }
    }
}

/// The three permutation indices of one directory.
#[derive(Debug)]
pub struct TripleIndex {
    spo: Triples,
    pso: Triples,
    ops: Triples,
}

impl TripleIndex {
    /// Open `spo.idx`, `pso.idx` and `ops.idx` in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            spo: Triples::open(dir.join(Permutation::Spo.file_name()))?,
            pso: Triples::open(dir.join(Permutation::Pso.file_name()))?,
            ops: Triples::open(dir.join(Permutation::Ops.file_name()))?,
        })
    }

    /// The index for `permutation`.
    pub fn get(&self, permutation: Permutation) -> &Triples {
        match permutation {
            Permutation::Spo => &self.spo,
            Permutation::Pso => &self.pso,
            Permutation::Ops => &self.ops,
        }
    }

    /// Whether `(s, p, o)` is stored.
    pub fn contains(&self, s: u64, p: u64, o: u64) -> Result<bool> {
        self.spo.contains(s, p, o)
    }

    /// Validate all three files and check they hold the same number of pairs.
    pub fn validate(&self) -> Result<()> {
        let mut counts = [0u64; 3];
        for (count, permutation) in counts.iter_mut().zip(Permutation::ALL) {
            let triples = self.get(permutation);
            triples.validate()?;
            *count = triples.pair_count()?;
        }
        if counts[0] != counts[1] || counts[0] != counts[2] {
            return Err(Error::corruption(format!(
                "permutations disagree on triple count: spo {}, pso {}, ops {}",
                counts[0], counts[1], counts[2]
            )));
        }
        Ok(())
    }

    /// Unmap all files. Idempotent.
    pub fn close(&mut self) {
        self.spo.close();
        self.pso.close();
        self.ops.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_roundtrip() {
        let spo = [1, 2, 3];
        for permutation in Permutation::ALL {
            assert_eq!(permutation.to_spo(permutation.from_spo(spo)), spo);
        }
        assert_eq!(Permutation::Pso.from_spo(spo), [2, 1, 3]);
        assert_eq!(Permutation::Ops.from_spo(spo), [3, 2, 1]);
    }

    #[test]
    fn test_shuffle_chain() {
        let spo = [10, 20, 30];
        let pso = Permutation::Spo.shuffle(Permutation::Pso, spo);
        assert_eq!(pso, [20, 10, 30]);
        let ops = Permutation::Pso.shuffle(Permutation::Ops, pso);
        assert_eq!(ops, [30, 20, 10]);
    }

    #[test]
    fn test_id_width() {
        assert_eq!(IdWidth::for_max(u32::MAX as u64), IdWidth::Four);
        assert_eq!(IdWidth::for_max(u32::MAX as u64 + 1), IdWidth::Eight);
        assert_eq!(IdWidth::Eight.bytes(), 8);
    }
}
