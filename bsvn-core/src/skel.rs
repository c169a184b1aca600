//! Skel codec
//!
//! A skel is either an atom (raw bytes) or a list of skels. Atoms are written
//! in implicit-length form (`howdy`) when the bytes allow it and in
//! explicit-length form (`5 howdy`) otherwise. Parsing is hand-written
//! recursive descent; parsed atoms are [`Bytes`] views sharing the input
//! buffer, so reading a record does not copy its contents.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Atoms at least this long are always written in explicit-length form
const IMPLICIT_LIMIT: usize = 100;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharType {
    Nothing,
    Space,
    Digit,
    Paren,
    Name,
}

fn char_type(b: u8) -> CharType {
    match b {
        b'\t' | b'\n' | 0x0c | b'\r' | b' ' => CharType::Space,
        b'0'..=b'9' => CharType::Digit,
        b'(' | b')' => CharType::Paren,
        b'A'..=b'Z' | b'a'..=b'z' => CharType::Name,
        _ => CharType::Nothing,
    }
}

/// Whether `b` may start an implicit-length atom
pub fn is_name_byte(b: u8) -> bool {
    char_type(b) == CharType::Name
}

/// Whether `b` is a skel whitespace byte
pub fn is_space_byte(b: u8) -> bool {
    char_type(b) == CharType::Space
}

/// A parsed or constructed skel
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Skel {
    Atom(Bytes),
    List(Vec<Skel>),
}

impl Skel {
    /// Build an atom from anything byte-like
    pub fn atom(data: impl Into<Bytes>) -> Self {
        Skel::Atom(data.into())
    }

    /// Build an atom from a string slice
    pub fn str_atom(s: &str) -> Self {
        Skel::Atom(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Build an atom holding a decimal number
    pub fn num_atom(n: u64) -> Self {
        Skel::Atom(Bytes::from(n.to_string()))
    }

    /// The empty atom, used for "none" in optional fields
    pub fn empty_atom() -> Self {
        Skel::Atom(Bytes::new())
    }

    pub fn list(children: Vec<Skel>) -> Self {
        Skel::List(children)
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Skel::Atom(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Skel::List(_))
    }

    pub fn as_atom(&self) -> Option<&Bytes> {
        match self {
            Skel::Atom(data) => Some(data),
            Skel::List(_) => None,
        }
    }

    /// Atom contents as UTF-8, if this is an atom holding valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_atom().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Atom contents parsed as a decimal number
    pub fn as_u64(&self) -> Option<u64> {
        let s = self.as_str()?;
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    }

    pub fn children(&self) -> Option<&[Skel]> {
        match self {
            Skel::List(children) => Some(children),
            Skel::Atom(_) => None,
        }
    }

    /// Number of children, or `None` for an atom
    pub fn list_len(&self) -> Option<usize> {
        self.children().map(|c| c.len())
    }

    /// Whether this is an atom whose bytes equal `s`
    pub fn matches_atom(&self, s: &str) -> bool {
        matches!(self, Skel::Atom(data) if data.as_ref() == s.as_bytes())
    }

    /// Parse one skel from the front of `data`.
    ///
    /// Returns `None` on any malformed input; bytes after a complete skel are
    /// ignored.
    pub fn parse(data: impl Into<Bytes>) -> Option<Skel> {
        let buf: Bytes = data.into();
        let mut parser = Parser { buf: &buf, pos: 0 };
        parser.parse()
    }

    /// Serialize to the canonical byte form
    pub fn unparse(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.estimate_size());
        unparse_into(self, &mut out);
        out.freeze()
    }

    fn estimate_size(&self) -> usize {
        match self {
            Skel::Atom(data) => data.len() + 5,
            Skel::List(children) => 2 + children.iter().map(|c| c.estimate_size() + 1).sum::<usize>(),
        }
    }
}

struct Parser<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn parse(&mut self) -> Option<Skel> {
        let c = self.peek()?;
        if c == b'(' {
            self.list()
        } else if char_type(c) == CharType::Name {
            self.implicit_atom()
        } else {
            self.explicit_atom()
        }
    }

    fn list(&mut self) -> Option<Skel> {
        // Skip the opening paren.
        self.pos += 1;
        let mut children = Vec::new();
        loop {
            while self.peek().is_some_and(is_space_byte) {
                self.pos += 1;
            }
            match self.peek() {
                None => return None,
                Some(b')') => {
                    self.pos += 1;
                    return Some(Skel::List(children));
                }
                Some(_) => children.push(self.parse()?),
            }
        }
    }

    fn implicit_atom(&mut self) -> Option<Skel> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match char_type(c) {
                CharType::Space | CharType::Paren => break,
                _ => self.pos += 1,
            }
        }
        Some(Skel::Atom(self.buf.slice(start..self.pos)))
    }

    fn explicit_atom(&mut self) -> Option<Skel> {
        let size = self.size()?;
        // Exactly one whitespace byte separates the length from the data.
        if !self.peek().is_some_and(is_space_byte) {
            return None;
        }
        self.pos += 1;
        if size > self.buf.len() - self.pos {
            return None;
        }
        let atom = self.buf.slice(self.pos..self.pos + size);
        self.pos += size;
        Some(Skel::Atom(atom))
    }

    fn size(&mut self) -> Option<usize> {
        let start = self.pos;
        let mut value: usize = 0;
        while let Some(c) = self.peek().filter(u8::is_ascii_digit) {
            value = value.checked_mul(10)?.checked_add(usize::from(c - b'0'))?;
            self.pos += 1;
        }
        (self.pos > start).then_some(value)
    }
}

fn use_implicit(data: &[u8]) -> bool {
    if data.is_empty() || data.len() >= IMPLICIT_LIMIT {
        return false;
    }
    if char_type(data[0]) != CharType::Name {
        return false;
    }
    data[1..]
        .iter()
        .all(|&b| !matches!(char_type(b), CharType::Space | CharType::Paren))
}

fn unparse_into(skel: &Skel, out: &mut BytesMut) {
    match skel {
        Skel::Atom(data) => {
            if use_implicit(data) {
                out.put_slice(data);
            } else {
                out.put_slice(data.len().to_string().as_bytes());
                out.put_u8(b' ');
                out.put_slice(data);
            }
        }
        Skel::List(children) => {
            out.put_u8(b'(');
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.put_u8(b' ');
                }
                unparse_into(child, out);
            }
            out.put_u8(b')');
        }
    }
}

impl fmt::Debug for Skel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Skel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.unparse()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SPACES: &[u8] = b"\t\n\x0c\r ";

    fn parse_str(s: &[u8]) -> Option<Skel> {
        Skel::parse(Bytes::copy_from_slice(s))
    }

    fn atom(s: &[u8]) -> Skel {
        Skel::Atom(Bytes::copy_from_slice(s))
    }

    #[test]
    fn test_implicit_single_byte_atoms() {
        for b in 0u8..=255 {
            if !is_name_byte(b) {
                continue;
            }
            for term in [b' ', b'\t', b'(', b')'] {
                let skel = parse_str(&[b, term]).unwrap();
                assert_eq!(skel, atom(&[b]));
            }
            // And at the end of the buffer.
            assert_eq!(parse_str(&[b]).unwrap(), atom(&[b]));
        }
    }

    #[test]
    fn test_implicit_atom_with_every_legal_byte() {
        let mut data = vec![b'a'];
        for b in 0u8..=255 {
            if !matches!(char_type(b), CharType::Space | CharType::Paren) {
                data.push(b);
            }
        }
        let skel = parse_str(&data).unwrap();
        assert_eq!(skel, atom(&data));
    }

    #[test]
    fn test_explicit_atoms_with_every_separator() {
        for len in [0usize, 1, 256] {
            let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            for &sep in SPACES {
                let mut buf = len.to_string().into_bytes();
                buf.push(sep);
                buf.extend_from_slice(&data);
                assert_eq!(parse_str(&buf).unwrap(), atom(&data));
            }
        }
    }

    #[test]
    fn test_explicit_atom_malformed() {
        // Non-separator after the length.
        assert!(parse_str(b"5xhowdy").is_none());
        // Length longer than the remaining data.
        assert!(parse_str(b"6 howdy").is_none());
        // No digits at all.
        assert!(parse_str(b" howdy").is_none());
        // Missing separator and data entirely.
        assert!(parse_str(b"5").is_none());
    }

    #[test]
    fn test_empty_input_is_invalid() {
        assert!(parse_str(b"").is_none());
    }

    #[test]
    fn test_list_malformed() {
        assert!(parse_str(b"(").is_none());
        assert!(parse_str(b"(   \t\n").is_none());
        assert!(parse_str(b"(a b").is_none());
        assert!(parse_str(b"(a 6 howdy)").is_none());
        assert!(parse_str(b"(a (b c)").is_none());
    }

    #[test]
    fn test_lists_with_every_separator_and_run_length() {
        for &sep in SPACES {
            for run in [0usize, 1, 4, 30] {
                for count in [0usize, 1, 4, 30] {
                    let gap = vec![sep; run];
                    // Adjacent atoms need at least one separator, so with a
                    // zero-length run the elements are lists instead.
                    let (element, expected_child): (&[u8], Skel) = if run == 0 {
                        (b"(x)", Skel::List(vec![atom(b"x")]))
                    } else {
                        (b"x", atom(b"x"))
                    };
                    let mut buf = vec![b'('];
                    buf.extend_from_slice(&gap);
                    for _ in 0..count {
                        buf.extend_from_slice(element);
                        buf.extend_from_slice(&gap);
                    }
                    buf.push(b')');
                    let skel = parse_str(&buf).unwrap();
                    assert_eq!(
                        skel,
                        Skel::List(vec![expected_child; count]),
                        "sep={sep} run={run} count={count}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_nested_lists() {
        let inner = Skel::list(vec![atom(b"a"), Skel::atom(Bytes::from_static(b"two words"))]);
        let outer = Skel::list(vec![inner.clone(), Skel::list(vec![inner.clone(), inner])]);
        assert_eq!(Skel::parse(outer.unparse()).unwrap(), outer);
    }

    #[test]
    fn test_adjacent_atom_and_paren_need_no_separator() {
        let skel = parse_str(b"(a(b)c)").unwrap();
        assert_eq!(
            skel,
            Skel::List(vec![atom(b"a"), Skel::List(vec![atom(b"b")]), atom(b"c")])
        );
    }

    #[test]
    fn test_unparse_canonical_forms() {
        let skel = Skel::list(vec![
            Skel::str_atom("file"),
            Skel::empty_atom(),
            Skel::str_atom("has space"),
            Skel::str_atom("9lives"),
            Skel::list(vec![]),
        ]);
        assert_eq!(
            skel.unparse().as_ref(),
            b"(file 0  9 has space 6 9lives ())".as_ref()
        );
        let long = vec![b'a'; IMPLICIT_LIMIT];
        let out = Skel::atom(long.clone()).unparse();
        assert!(out.starts_with(b"100 "));
    }

    #[test]
    fn test_parsed_atoms_share_buffer() {
        let buf = Bytes::from_static(b"(abc 3 def)");
        let skel = Skel::parse(buf.clone()).unwrap();
        let first = skel.children().unwrap()[0].as_atom().unwrap().clone();
        let range = buf.as_ptr() as usize..buf.as_ptr() as usize + buf.len();
        assert!(range.contains(&(first.as_ptr() as usize)));
    }

    fn arb_skel() -> impl Strategy<Value = Skel> {
        let leaf = proptest::collection::vec(any::<u8>(), 0..40).prop_map(|v| Skel::Atom(Bytes::from(v)));
        leaf.prop_recursive(4, 64, 30, |inner| {
            proptest::collection::vec(inner, 0..30).prop_map(Skel::List)
        })
    }

    proptest! {
        #[test]
        fn prop_parse_unparse_roundtrip(skel in arb_skel()) {
            let bytes = skel.unparse();
            let parsed = Skel::parse(bytes).unwrap();
            prop_assert_eq!(parsed, skel);
        }
    }
}
