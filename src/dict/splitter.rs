//! Decomposition of terms into a shareable part and a local residual.
//!
//! IRIs share everything up to and including their last `/` or `#`; literals
//! with a long enough language tag or datatype share the text after their
//! closing quote. The shared part is stored once in a separate dictionary
//! and referenced from composite entries by a 4-byte code:
//!
//! ```text
//! [code: 4 base64 chars, 6 bits each, big-endian][marker: '.' prefix/none, '!' suffix][local]
//! ```

use crate::config::MAX_SHARED_ID;
use crate::dict::syntax::rfind_unescaped;
use crate::dict::TermView;
use crate::error::{Error, Result};
use crate::MIN_ID;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Minimum length of a literal suffix worth sharing.
pub const MIN_SHARED_LEN: usize = 6;

/// Length of the shared-id code plus marker.
pub const CODE_LEN: usize = 5;

/// Shared id written in place of ids that do not fit the code.
///
/// This is the id of the empty string in the shared dictionary, so an entry
/// under the sentinel decodes to its local bytes alone.
pub const SENTINEL_SHARED_ID: u64 = MIN_ID;

const MARKER_PREFIX: u8 = b'.';
const MARKER_SUFFIX: u8 = b'!';

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const DECODE: [u8; 256] = {
    let mut table = [0xffu8; 256];
    let mut i = 0;
    while i < 64 {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Which terms are split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    /// Split IRIs by prefix and literals by suffix.
    #[default]
    PrefixAndSuffix,
    /// Split IRIs only.
    PrefixOnly,
}

/// Where the shared part sits in the original term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedSide {
    /// Shared part is a prefix.
    Prefix,
    /// Shared part is a suffix.
    Suffix,
    /// Nothing is shared; `local` is the whole term.
    None,
}

/// Result of splitting a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split<'a> {
    /// Position of the shared part.
    pub side: SharedSide,
    /// Shared part, empty when `side` is `None`.
    pub shared: Cow<'a, [u8]>,
    /// Residual stored in the composite entry.
    pub local: Cow<'a, [u8]>,
}

/// Splits terms according to a [`SplitMode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Splitter {
    mode: SplitMode,
}

impl Splitter {
    /// Create a splitter.
    pub fn new(mode: SplitMode) -> Self {
        Self { mode }
    }

    /// The configured mode.
    pub fn mode(&self) -> SplitMode {
        self.mode
    }

    /// Split a contiguous term.
    pub fn split<'a>(&self, term: &'a [u8]) -> Split<'a> {
        self.split_view(TermView::single(term))
    }

    /// Split a possibly two-segment term.
    ///
    /// Parts lying within one segment are borrowed; a part spanning the
    /// segment boundary is copied.
    pub fn split_view<'a>(&self, term: TermView<'a>) -> Split<'a> {
        let len = term.len();
        let boundary = match term.bytes().next() {
            Some(b'"') if self.mode == SplitMode::PrefixAndSuffix => {
                literal_boundary(&term).map(|b| (SharedSide::Suffix, b))
            }
            Some(b'<') => iri_boundary(&term).map(|b| (SharedSide::Prefix, b)),
            _ => None,
        };

        match boundary {
            Some((SharedSide::Prefix, at)) => Split {
                side: SharedSide::Prefix,
                shared: term.slice(0, at),
                local: term.slice(at, len),
            },
            Some((side, at)) => Split { side, shared: term.slice(at, len), local: term.slice(0, at) },
            None => Split { side: SharedSide::None, shared: Cow::Borrowed(&[]), local: term.slice(0, len) },
        }
    }
}

/// Start of the shared suffix: one past the last unescaped quote.
fn literal_boundary(term: &TermView<'_>) -> Option<usize> {
    let bytes = contiguous(term);
    let close = rfind_unescaped(&bytes, 1, |b| b == b'"')?;
    let at = close + 1;
    if bytes.len() - at >= MIN_SHARED_LEN {
        Some(at)
    } else {
        None
    }
}

/// End of the shared prefix: one past the last unescaped `/` or `#`.
fn iri_boundary(term: &TermView<'_>) -> Option<usize> {
    let bytes = contiguous(term);
    rfind_unescaped(&bytes, 1, |b| b == b'/' || b == b'#').map(|sep| sep + 1)
}

fn contiguous<'a>(term: &TermView<'a>) -> Cow<'a, [u8]> {
    match term.as_single() {
        Some(bytes) => Cow::Borrowed(bytes),
        None => Cow::Owned(term.to_vec()),
    }
}

/// Encode a shared id and side as a 5-byte code.
///
/// Ids above 2^24 - 1 are replaced by [`SENTINEL_SHARED_ID`] with the prefix marker.
pub fn encode_shared_id(shared_id: u64, side: SharedSide) -> [u8; CODE_LEN] {
    let (id, side) = if shared_id > MAX_SHARED_ID {
        (SENTINEL_SHARED_ID, SharedSide::None)
    } else {
        (shared_id, side)
    };
    let marker = match side {
        SharedSide::Suffix => MARKER_SUFFIX,
        SharedSide::Prefix | SharedSide::None => MARKER_PREFIX,
    };
    [
        ALPHABET[((id >> 18) & 0x3f) as usize],
        ALPHABET[((id >> 12) & 0x3f) as usize],
        ALPHABET[((id >> 6) & 0x3f) as usize],
        ALPHABET[(id & 0x3f) as usize],
        marker,
    ]
}

/// Decode a 5-byte code back into a shared id and side.
///
/// The prefix marker decodes as [`SharedSide::Prefix`]; an unshared entry is a
/// prefix entry whose shared part is empty.
pub fn decode_shared_id(bytes: &[u8]) -> Result<(u64, SharedSide)> {
    if bytes.len() < CODE_LEN {
        return Err(Error::corruption(format!("shared id code too short: {} bytes", bytes.len())));
    }
    let mut id = 0u64;
    for &b in &bytes[..4] {
        let digit = DECODE[b as usize];
        if digit == 0xff {
            return Err(Error::corruption(format!("invalid shared id code byte {:#04x}", b)));
        }
        id = (id << 6) | digit as u64;
    }
    let side = match bytes[4] {
        MARKER_PREFIX => SharedSide::Prefix,
        MARKER_SUFFIX => SharedSide::Suffix,
        other => {
            return Err(Error::corruption(format!("invalid shared side marker {:#04x}", other)))
        }
    };
    Ok((id, side))
}

/// Append the composite key `[code][local]` to `buf`.
pub fn composite_key(code: [u8; CODE_LEN], local: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.reserve(CODE_LEN + local.len());
    buf.extend_from_slice(&code);
    buf.extend_from_slice(local);
}
