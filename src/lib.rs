//! # termstore - Immutable Term Dictionaries and Triple Indices
//!
//! termstore builds and reads the two file families at the bottom of a graph
//! store: dictionaries mapping term strings to dense integer ids, and
//! permutation indices over `(subject, predicate, object)` id triples.
//!
//! ## Architecture
//!
//! - **Offset table** (`table`): memory-mapped header + offsets + payload reader
//! - **Dictionaries** (`dict`): flat sorted, locality (tree order) and
//!   composite (shared prefix/suffix) lookups
//! - **External sort** (`sort`): fixed blocks spilled by a background thread
//!   and merged k-way
//! - **Triples** (`triples`): SPO, PSO and OPS indices with pair, value and
//!   sub-key cursors
//! - **Builder** (`builder`): two-pass construction of a composite dictionary
//!
//! Files are written once and then only read; readers are lock-free.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use termstore::builder;
//! use termstore::config::{CompositeOptions, TriplesOptions};
//! use termstore::triples::TriplesSorter;
//! use termstore::TermLookup;
//!
//! # fn main() -> Result<(), termstore::Error> {
//! let terms = ["<http://ex.org/ns#alice>", "<http://ex.org/ns#knows>", "<http://ex.org/ns#bob>"];
//! let dicts = builder::build("./data/dict", CompositeOptions::default(), || terms.iter())?;
//!
//! let id = |t: &str| dicts.find(t.as_bytes());
//! let sorter = TriplesSorter::new("triples", TriplesOptions::default())?;
//! sorter.add(id(terms[0])?, id(terms[1])?, id(terms[2])?)?;
//! let index = sorter.finish("./data/index".as_ref())?;
//!
//! for (p, o) in index.get(termstore::Permutation::Spo).pairs(id(terms[0])?)? {
//!     if let (Some(p), Some(o)) = (dicts.get(p)?, dicts.get(o)?) {
//!         println!("{} {}", p, o);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod builder;
pub mod config;
pub mod dict;
pub mod error;
pub mod sort;
pub mod table;
pub mod triples;

// Re-exports
pub use builder::{CompositeDictBuilder, CompositeDicts};
pub use config::{CompositeOptions, SortOptions, TriplesOptions};
pub use dict::{open_lookup, Dict, DictFlags, TermLookup, TermView};
pub use error::{Error, Result};
pub use triples::{Permutation, TripleIndex, Triples};

/// Smallest valid id.
pub const MIN_ID: u64 = 1;

/// Returned by lookups for absent terms.
pub const NOT_FOUND: u64 = 0;
