//! Lookup over a flat, byte-sorted dictionary.

use crate::dict::{flat_position, position_to_id, Dict, DictFlags, TermLookup, TermSyntax, TermView};
use crate::error::Result;

/// Binary-search lookup over a flat sorted [`Dict`].
#[derive(Debug)]
pub struct SortedLookup {
    dict: Dict,
    syntax: TermSyntax,
}

impl SortedLookup {
    /// Wrap an opened dictionary. Validation expects complete terms.
    pub fn new(dict: Dict) -> Self {
        Self { dict, syntax: TermSyntax::Term }
    }

    /// Use `syntax` when validating entries.
    pub fn with_syntax(mut self, syntax: TermSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// The underlying dictionary.
    pub fn dict(&self) -> &Dict {
        &self.dict
    }
}

impl TermLookup for SortedLookup {
    fn find(&self, term: &[u8]) -> Result<u64> {
        Ok(position_to_id(self.dict.search(term)?))
    }

    fn get(&self, id: u64) -> Result<Option<TermView<'_>>> {
        match flat_position(&self.dict, id) {
            Some(position) => Ok(Some(TermView::single(self.dict.entry(position)?))),
            None => Ok(None),
        }
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
