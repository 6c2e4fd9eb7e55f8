//! Syntactic checks applied by dictionary validation.

/// What a dictionary's entries are expected to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSyntax {
    /// Complete terms: quoted literals, `<iri>`, `_:label`, or the empty string.
    Term,
    /// Shared parts of split terms: the empty sentinel, an IRI prefix,
    /// or a literal suffix (`@lang`, `^^<datatype>`).
    SharedPart,
    /// No syntax check.
    Any,
}

impl TermSyntax {
    /// Whether `bytes` is acceptable under this syntax.
    pub fn accepts(self, bytes: &[u8]) -> bool {
        match self {
            TermSyntax::Term => is_term(bytes),
            TermSyntax::SharedPart => is_shared_part(bytes),
            TermSyntax::Any => true,
        }
    }
}

/// Whether the byte at `index` is preceded by an odd number of backslashes.
pub(crate) fn is_escaped(bytes: &[u8], index: usize) -> bool {
    let backslashes = bytes[..index].iter().rev().take_while(|&&b| b == b'\\').count();
    backslashes % 2 == 1
}

/// Position of the last unescaped `needle` at or after `from`.
pub(crate) fn rfind_unescaped(bytes: &[u8], from: usize, needle: impl Fn(u8) -> bool) -> Option<usize> {
    (from..bytes.len()).rev().find(|&i| needle(bytes[i]) && !is_escaped(bytes, i))
}

fn is_term(bytes: &[u8]) -> bool {
    match bytes.first() {
        None => true,
        Some(b'<') => bytes.len() >= 2 && bytes[bytes.len() - 1] == b'>',
        Some(b'_') => bytes.len() > 2 && bytes[1] == b':',
        Some(b'"') => match rfind_unescaped(bytes, 1, |b| b == b'"') {
            Some(close) => is_literal_suffix(&bytes[close + 1..]),
            None => false,
        },
        Some(_) => false,
    }
}

fn is_literal_suffix(tail: &[u8]) -> bool {
    if tail.is_empty() {
        return true;
    }
    if tail[0] == b'@' {
        return tail.len() > 1;
    }
    tail.len() > 4 && tail.starts_with(b"^^<") && tail[tail.len() - 1] == b'>'
}

fn is_shared_part(bytes: &[u8]) -> bool {
    match bytes.first() {
        None => true,
        Some(b'<') => true,
        Some(b'@') => bytes.len() > 1,
        Some(b'^') => bytes.starts_with(b"^^"),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms() {
        let syntax = TermSyntax::Term;
        assert!(syntax.accepts(b""));
        assert!(syntax.accepts(b"<http://ex.org/a>"));
        assert!(syntax.accepts(b"_:b0"));
        assert!(syntax.accepts(b"\"plain\""));
        assert!(syntax.accepts(b"\"hello\"@en-US"));
        assert!(syntax.accepts(b"\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>"));
        assert!(syntax.accepts(b"\"say \\\"hi\\\"\""));

        assert!(!syntax.accepts(b"plain"));
        assert!(!syntax.accepts(b"<unterminated"));
        assert!(!syntax.accepts(b"_:"));
        assert!(!syntax.accepts(b"\"open"));
        assert!(!syntax.accepts(b"\"escaped close\\\""));
        assert!(!syntax.accepts(b"\"x\"junk"));
    }

    #[test]
    fn test_shared_parts() {
        let syntax = TermSyntax::SharedPart;
        assert!(syntax.accepts(b""));
        assert!(syntax.accepts(b"<http://ex.org/"));
        assert!(syntax.accepts(b"@en-US"));
        assert!(syntax.accepts(b"^^<http://www.w3.org/2001/XMLSchema#integer>"));
        assert!(!syntax.accepts(b"\"literal\""));
        assert!(!syntax.accepts(b"@"));
    }

    #[test]
    fn test_escape_counting() {
        assert!(is_escaped(b"a\\\"", 2));
        assert!(!is_escaped(b"a\\\\\"", 3));
        assert!(!is_escaped(b"\"", 0));
    }
}
