//! Multi-way merge over sorted run files.
//!
//! Run counts stay small (one per spilled block), so the next key is picked
//! by a linear scan over the open cursors rather than a heap.

use crate::error::Result;
use crate::sort::RunCursor;

/// Merges several sorted run cursors into one ascending stream.
///
/// Equal keys from different runs are all yielded, lowest run index first;
/// callers decide whether to keep duplicates.
pub struct KWayMerge<C: RunCursor> {
    cursors: Vec<C>,
}

impl<C: RunCursor> KWayMerge<C> {
    /// Create a merge over `cursors`, each positioned at its first key.
    pub fn new(cursors: Vec<C>) -> Self {
        Self { cursors }
    }

    /// The cursors being merged.
    pub fn cursors(&self) -> &[C] {
        &self.cursors
    }

    /// Index of the cursor holding the smallest current key.
    fn min_index(&self) -> Option<usize> {
        let mut best: Option<(usize, &C::Key)> = None;
        for (index, cursor) in self.cursors.iter().enumerate() {
            if let Some(key) = cursor.peek() {
                match best {
                    Some((_, current)) if current <= key => {}
                    _ => best = Some((index, key)),
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// Feed every key to `f` in ascending order.
    pub fn for_each<F>(mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&C::Key) -> Result<()>,
    {
        while let Some(index) = self.min_index() {
            let cursor = &mut self.cursors[index];
            if let Some(key) = cursor.peek() {
                f(key)?;
            }
            cursor.advance()?;
        }
        Ok(())
    }
}
