//! Wire items, the buffered connection and the tuple format language
//!
//! Every token is followed by one whitespace byte:
//! - number: `123 `
//! - string: `5:hello ` (binary safe)
//! - word: `success `
//! - list: `( ` items `) `
//!
//! A tuple format string describes a list's contents: `n` number, `r`
//! revision, `s` string, `c` UTF-8 string, `w` word, `b` boolean word, `l`
//! raw list, `(` `)` a nested tuple. `[` or `?` starts an optional tail that
//! runs to the end of the enclosing tuple; the tail is either entirely
//! present or entirely absent. Numbers and booleans have no absent form and
//! are never allowed in an optional tail.

use crate::error::{ErrorChain, ErrorItem, RaError, Result};
use bsvn_core::Revnum;
use bytes::Bytes;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::TcpStream;
use tracing::trace;

/// Nesting deeper than this is treated as malformed input
const MAX_LIST_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Number(u64),
    String(Bytes),
    Word(String),
    List(Vec<Item>),
}

impl Item {
    pub fn string(data: impl Into<Bytes>) -> Self {
        Item::String(data.into())
    }

    pub fn str(text: &str) -> Self {
        Item::String(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn word(word: &str) -> Self {
        Item::Word(word.to_string())
    }

    pub fn bool(value: bool) -> Self {
        Item::word(if value { "true" } else { "false" })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Item::Number(_) => "number",
            Item::String(_) => "string",
            Item::Word(_) => "word",
            Item::List(_) => "list",
        }
    }
}

/// A value to write through a tuple format
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Number(u64),
    Rev(Option<Revnum>),
    Str(Option<&'a [u8]>),
    CStr(Option<&'a str>),
    Word(Option<&'a str>),
    Bool(bool),
    List(&'a [Item]),
}

impl Arg<'_> {
    fn is_absent(&self) -> bool {
        matches!(
            self,
            Arg::Rev(None) | Arg::Str(None) | Arg::CStr(None) | Arg::Word(None)
        )
    }
}

/// A value read through a tuple format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Number(u64),
    Rev(Option<Revnum>),
    String(Option<Bytes>),
    CString(Option<String>),
    Word(Option<String>),
    Bool(bool),
    List(Vec<Item>),
    Tuple(Option<Tuple>),
}

/// Values parsed from a list, consumed in format order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    values: std::collections::VecDeque<Value>,
}

impl Tuple {
    fn next(&mut self, want: &str) -> Result<Value> {
        self.values
            .pop_front()
            .ok_or_else(|| RaError::InvalidFormat(format!("tuple has no {} left", want)))
    }

    fn mismatch(want: &str, got: &Value) -> RaError {
        RaError::InvalidFormat(format!("expected {}, tuple holds {:?}", want, got))
    }

    pub fn number(&mut self) -> Result<u64> {
        match self.next("number")? {
            Value::Number(n) => Ok(n),
            v => Err(Self::mismatch("number", &v)),
        }
    }

    pub fn rev(&mut self) -> Result<Option<Revnum>> {
        match self.next("revision")? {
            Value::Rev(r) => Ok(r),
            v => Err(Self::mismatch("revision", &v)),
        }
    }

    pub fn string(&mut self) -> Result<Option<Bytes>> {
        match self.next("string")? {
            Value::String(s) => Ok(s),
            v => Err(Self::mismatch("string", &v)),
        }
    }

    pub fn cstring(&mut self) -> Result<Option<String>> {
        match self.next("cstring")? {
            Value::CString(s) => Ok(s),
            v => Err(Self::mismatch("cstring", &v)),
        }
    }

    /// A cstring that the format does not allow to be absent
    pub fn req_cstring(&mut self) -> Result<String> {
        self.cstring()?
            .ok_or_else(|| RaError::InvalidFormat("required cstring is absent".into()))
    }

    pub fn word(&mut self) -> Result<Option<String>> {
        match self.next("word")? {
            Value::Word(w) => Ok(w),
            v => Err(Self::mismatch("word", &v)),
        }
    }

    pub fn req_word(&mut self) -> Result<String> {
        self.word()?
            .ok_or_else(|| RaError::InvalidFormat("required word is absent".into()))
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.next("boolean")? {
            Value::Bool(b) => Ok(b),
            v => Err(Self::mismatch("boolean", &v)),
        }
    }

    pub fn list(&mut self) -> Result<Vec<Item>> {
        match self.next("list")? {
            Value::List(l) => Ok(l),
            v => Err(Self::mismatch("list", &v)),
        }
    }

    /// A nested tuple; `None` when it sat in an absent optional tail
    pub fn tuple(&mut self) -> Result<Option<Tuple>> {
        match self.next("tuple")? {
            Value::Tuple(t) => Ok(t),
            v => Err(Self::mismatch("tuple", &v)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Check bracket balance and that no `n` or `b` sits in an optional tail
pub fn validate_format(fmt: &str) -> Result<()> {
    let invalid = || RaError::InvalidFormat(fmt.to_string());
    // One entry per open tuple: whether an optional tail has started in it.
    let mut levels = vec![false];
    let mut brackets = 0usize;
    for c in fmt.chars() {
        let optional = levels.last().copied().ok_or_else(invalid)?;
        match c {
            '(' => levels.push(false),
            ')' => {
                levels.pop();
                if levels.is_empty() {
                    return Err(invalid());
                }
            }
            '[' => {
                brackets += 1;
                if let Some(level) = levels.last_mut() {
                    *level = true;
                }
            }
            '?' => {
                if let Some(level) = levels.last_mut() {
                    *level = true;
                }
            }
            ']' => brackets = brackets.checked_sub(1).ok_or_else(invalid)?,
            'n' | 'b' if optional => return Err(invalid()),
            'n' | 'b' | 'r' | 's' | 'c' | 'w' | 'l' => {}
            _ => return Err(invalid()),
        }
    }
    if levels.len() != 1 || brackets != 0 {
        return Err(invalid());
    }
    Ok(())
}

/// Parse `items` against `fmt`
pub fn parse_tuple(items: &[Item], fmt: &str) -> Result<Tuple> {
    validate_format(fmt)?;
    let fmt = fmt.as_bytes();
    let mut pos = 0;
    let mut values = Vec::new();
    parse_level(items, fmt, &mut pos, &mut values)?;
    Ok(Tuple {
        values: values.into(),
    })
}

/// Parse one tuple level, stopping at its `)` or the end of the format
fn parse_level(items: &[Item], fmt: &[u8], pos: &mut usize, out: &mut Vec<Value>) -> Result<()> {
    let mut idx = 0;
    let mut tail_start: Option<usize> = None;
    while *pos < fmt.len() {
        let c = fmt[*pos];
        match c {
            b')' => break,
            b'[' | b'?' => {
                tail_start.get_or_insert(idx);
                *pos += 1;
                continue;
            }
            b']' => {
                *pos += 1;
                continue;
            }
            _ => {}
        }
        if idx == items.len() {
            if tail_start == Some(idx) {
                fill_absent(fmt, pos, out);
                break;
            }
            return Err(RaError::malformed(format!(
                "tuple ended after {} items, format '{}' wants more",
                idx,
                String::from_utf8_lossy(fmt)
            )));
        }
        let item = &items[idx];
        let value = match (c, item) {
            (b'n', Item::Number(n)) => Value::Number(*n),
            (b'r', Item::Number(n)) => Value::Rev(Some(*n)),
            (b's', Item::String(s)) => Value::String(Some(s.clone())),
            (b'c', Item::String(s)) => {
                let text = std::str::from_utf8(s).map_err(|_| RaError::malformed("string is not UTF-8"))?;
                Value::CString(Some(text.to_string()))
            }
            (b'w', Item::Word(w)) => Value::Word(Some(w.clone())),
            (b'b', Item::Word(w)) => match w.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(RaError::malformed(format!("'{}' is not a boolean", w))),
            },
            (b'l', Item::List(l)) => Value::List(l.clone()),
            (b'(', Item::List(l)) => {
                *pos += 1;
                let mut inner = Vec::new();
                parse_level(l, fmt, pos, &mut inner)?;
                Value::Tuple(Some(Tuple {
                    values: inner.into(),
                }))
            }
            (_, item) => {
                return Err(RaError::malformed(format!(
                    "found {} where format '{}' wants '{}'",
                    item.kind_name(),
                    String::from_utf8_lossy(fmt),
                    c as char
                )));
            }
        };
        out.push(value);
        idx += 1;
        *pos += 1;
    }
    if idx != items.len() {
        return Err(RaError::malformed(format!(
            "tuple has {} items, format '{}' takes {}",
            items.len(),
            String::from_utf8_lossy(fmt),
            idx
        )));
    }
    Ok(())
}

/// Emit absent values for the rest of this level's format
fn fill_absent(fmt: &[u8], pos: &mut usize, out: &mut Vec<Value>) {
    while *pos < fmt.len() {
        let value = match fmt[*pos] {
            b')' => return,
            b'r' => Value::Rev(None),
            b's' => Value::String(None),
            b'c' => Value::CString(None),
            b'w' => Value::Word(None),
            b'l' => Value::List(Vec::new()),
            b'(' => {
                skip_tuple(fmt, pos);
                Value::Tuple(None)
            }
            _ => {
                *pos += 1;
                continue;
            }
        };
        out.push(value);
        *pos += 1;
    }
}

/// Move `pos` from a `(` to its matching `)`
fn skip_tuple(fmt: &[u8], pos: &mut usize) {
    let mut depth = 0usize;
    while *pos < fmt.len() {
        match fmt[*pos] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
        *pos += 1;
    }
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\n'
}

fn map_io(e: std::io::Error) -> RaError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            RaError::ConnectionClosed
        }
        _ => RaError::Io(e),
    }
}

/// A protocol connection over any byte stream.
///
/// Writes collect in a buffer that goes out on [`Conn::flush`] or right
/// before the next read.
pub struct Conn {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    out: Vec<u8>,
}

impl Conn {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            out: Vec::new(),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self::new(Box::new(reader), Box::new(stream)))
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.out.is_empty() {
            self.writer.write_all(&self.out).map_err(map_io)?;
            self.out.clear();
        }
        self.writer.flush().map_err(map_io)
    }

    // ---- writing ----

    pub fn write_number(&mut self, n: u64) {
        self.out.extend_from_slice(n.to_string().as_bytes());
        self.out.push(b' ');
    }

    pub fn write_string(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data.len().to_string().as_bytes());
        self.out.push(b':');
        self.out.extend_from_slice(data);
        self.out.push(b' ');
    }

    pub fn write_cstring(&mut self, text: &str) {
        self.write_string(text.as_bytes());
    }

    pub fn write_word(&mut self, word: &str) {
        self.out.extend_from_slice(word.as_bytes());
        self.out.push(b' ');
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_word(if value { "true" } else { "false" });
    }

    pub fn start_list(&mut self) {
        self.out.extend_from_slice(b"( ");
    }

    pub fn end_list(&mut self) {
        self.out.extend_from_slice(b") ");
    }

    pub fn write_item(&mut self, item: &Item) {
        match item {
            Item::Number(n) => self.write_number(*n),
            Item::String(s) => self.write_string(s),
            Item::Word(w) => self.write_word(w),
            Item::List(items) => {
                self.start_list();
                for i in items {
                    self.write_item(i);
                }
                self.end_list();
            }
        }
    }

    /// Write the contents of a tuple (without its surrounding parens)
    pub fn write_tuple(&mut self, fmt: &str, args: &[Arg<'_>]) -> Result<()> {
        validate_format(fmt)?;
        let invalid = || RaError::InvalidFormat(fmt.to_string());
        let mut args = args.iter();
        // Per level: (optional tail started, an optional value was absent)
        let mut levels = vec![(false, false)];
        for c in fmt.chars() {
            match c {
                '(' => {
                    self.start_list();
                    levels.push((false, false));
                    continue;
                }
                ')' => {
                    self.end_list();
                    levels.pop();
                    continue;
                }
                '[' | '?' => {
                    if let Some(level) = levels.last_mut() {
                        level.0 = true;
                    }
                    continue;
                }
                ']' => continue,
                _ => {}
            }
            let arg = args.next().ok_or_else(invalid)?;
            let level = levels.last_mut().ok_or_else(invalid)?;
            if arg.is_absent() {
                if !level.0 {
                    return Err(invalid());
                }
                level.1 = true;
                continue;
            }
            if level.1 {
                // A value after an absent one would shift the tail.
                return Err(invalid());
            }
            match (c, arg) {
                ('n', Arg::Number(n)) => self.write_number(*n),
                ('r', Arg::Rev(Some(r))) => self.write_number(*r),
                ('s', Arg::Str(Some(s))) => self.write_string(s),
                ('c', Arg::CStr(Some(s))) => self.write_cstring(s),
                ('w', Arg::Word(Some(w))) => self.write_word(w),
                ('b', Arg::Bool(b)) => self.write_bool(*b),
                ('l', Arg::List(items)) => {
                    self.start_list();
                    for i in *items {
                        self.write_item(i);
                    }
                    self.end_list();
                }
                _ => return Err(invalid()),
            }
        }
        if args.next().is_some() {
            return Err(invalid());
        }
        Ok(())
    }

    /// `( name ( args ) )`
    pub fn write_command(&mut self, name: &str, fmt: &str, args: &[Arg<'_>]) -> Result<()> {
        self.start_list();
        self.write_word(name);
        self.start_list();
        self.write_tuple(fmt, args)?;
        self.end_list();
        self.end_list();
        Ok(())
    }

    /// `( success ( args ) )`
    pub fn write_success(&mut self, fmt: &str, args: &[Arg<'_>]) -> Result<()> {
        self.write_command("success", fmt, args)
    }

    /// `( failure ( ( code message file line ) ... ) )`, outermost first
    pub fn write_failure(&mut self, chain: &ErrorChain) {
        self.start_list();
        self.write_word("failure");
        self.start_list();
        for item in &chain.items {
            self.start_list();
            self.write_number(item.code);
            self.write_cstring(&item.message);
            self.write_cstring(&item.file);
            self.write_number(item.line);
            self.end_list();
        }
        self.end_list();
        self.end_list();
    }

    // ---- reading ----

    fn peek_byte(&mut self) -> Result<u8> {
        let buf = self.reader.fill_buf().map_err(map_io)?;
        buf.first().copied().ok_or(RaError::ConnectionClosed)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = self.peek_byte()?;
        self.reader.consume(1);
        Ok(b)
    }

    fn skip_ws(&mut self) -> Result<u8> {
        loop {
            let b = self.read_byte()?;
            if !is_ws(b) {
                return Ok(b);
            }
        }
    }

    fn expect_ws(&mut self, after: &str) -> Result<()> {
        if is_ws(self.read_byte()?) {
            Ok(())
        } else {
            Err(RaError::malformed(format!("{} not followed by whitespace", after)))
        }
    }

    /// Read the next item, flushing pending writes first
    pub fn read_item(&mut self) -> Result<Item> {
        self.flush()?;
        let first = self.skip_ws()?;
        self.read_item_from(first, 0)
    }

    fn read_item_from(&mut self, first: u8, depth: usize) -> Result<Item> {
        match first {
            b'0'..=b'9' => {
                let mut n = u64::from(first - b'0');
                loop {
                    let b = self.read_byte()?;
                    match b {
                        b'0'..=b'9' => {
                            n = n
                                .checked_mul(10)
                                .and_then(|n| n.checked_add(u64::from(b - b'0')))
                                .ok_or_else(|| RaError::malformed("number too large"))?;
                        }
                        b':' => return self.read_string_body(n),
                        b if is_ws(b) => return Ok(Item::Number(n)),
                        _ => return Err(RaError::malformed("number not followed by whitespace")),
                    }
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' => {
                let mut word = String::new();
                word.push(first as char);
                loop {
                    let b = self.read_byte()?;
                    match b {
                        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => word.push(b as char),
                        b if is_ws(b) => return Ok(Item::Word(word)),
                        _ => return Err(RaError::malformed("word not followed by whitespace")),
                    }
                }
            }
            b'(' => {
                if depth >= MAX_LIST_DEPTH {
                    return Err(RaError::malformed("lists nested too deeply"));
                }
                self.expect_ws("'('")?;
                let mut items = Vec::new();
                loop {
                    let b = self.skip_ws()?;
                    if b == b')' {
                        self.expect_ws("')'")?;
                        return Ok(Item::List(items));
                    }
                    items.push(self.read_item_from(b, depth + 1)?);
                }
            }
            other => Err(RaError::malformed(format!("unexpected byte 0x{:02x}", other))),
        }
    }

    fn read_string_body(&mut self, len: u64) -> Result<Item> {
        let mut data = Vec::new();
        let read = (&mut self.reader)
            .take(len)
            .read_to_end(&mut data)
            .map_err(map_io)?;
        if read as u64 != len {
            return Err(RaError::ConnectionClosed);
        }
        self.expect_ws("string")?;
        Ok(Item::String(Bytes::from(data)))
    }

    /// Read a list item and parse it against `fmt`
    pub fn read_tuple(&mut self, fmt: &str) -> Result<Tuple> {
        match self.read_item()? {
            Item::List(items) => parse_tuple(&items, fmt),
            other => Err(RaError::malformed(format!("expected a list, found {}", other.kind_name()))),
        }
    }

    /// Read `( success ( ... ) )` or `( failure ( ... ) )`.
    ///
    /// A failure comes back as [`RaError::Command`] carrying the peer's
    /// error chain.
    pub fn read_response(&mut self, fmt: &str) -> Result<Tuple> {
        let mut outer = self.read_tuple("wl")?;
        let status = outer.req_word()?;
        let params = outer.list()?;
        match status.as_str() {
            "success" => parse_tuple(&params, fmt),
            "failure" => Err(RaError::Command(parse_failure(&params)?)),
            other => Err(RaError::malformed(format!("unknown response status '{}'", other))),
        }
    }

    /// Read `( name ( params ) )`
    pub fn read_command(&mut self) -> Result<(String, Vec<Item>)> {
        let mut tuple = self.read_tuple("wl")?;
        let name = tuple.req_word()?;
        let params = tuple.list()?;
        trace!("read command {}", name);
        Ok((name, params))
    }
}

fn parse_failure(params: &[Item]) -> Result<ErrorChain> {
    if params.is_empty() {
        return Err(RaError::malformed("empty error list"));
    }
    let mut items = Vec::with_capacity(params.len());
    for item in params {
        let Item::List(fields) = item else {
            return Err(RaError::malformed("error entry is not a list"));
        };
        let mut t = parse_tuple(fields, "nccn")?;
        items.push(ErrorItem {
            code: t.number()?,
            message: t.req_cstring()?,
            file: t.req_cstring()?,
            line: t.number()?,
        });
    }
    Ok(ErrorChain { items })
}
