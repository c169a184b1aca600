//! svndiff version 0: text delta windows and their byte encoding
//!
//! A delta stream is the header `SVN\0` followed by windows. Each window is
//! five varints (source view offset, source view length, target view length,
//! instruction length, new-data length), then the instructions, then the new
//! data. An instruction's top two bits select the opcode (copy from source,
//! copy from target, copy from new data); the low six bits hold the length,
//! or zero with the length following as a varint. Source and target copies
//! are followed by a varint offset.

use crate::error::{FsError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

pub const HEADER: &[u8; 4] = b"SVN\0";

/// Matches shorter than this are sent as new data
const MATCH_BLOCK: usize = 8;

/// Varints longer than this cannot hold a u64
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes from the source view at `offset`
    Source { offset: usize, len: usize },
    /// Copy `len` bytes from the target produced so far, starting at `offset`
    Target { offset: usize, len: usize },
    /// Copy the next `len` bytes of new data
    New { len: usize },
}

/// One window of a text delta
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxDeltaWindow {
    pub sview_offset: u64,
    pub sview_len: usize,
    pub tview_len: usize,
    pub ops: Vec<DeltaOp>,
    pub new_data: Bytes,
}

impl TxDeltaWindow {
    /// A window producing `data` without reading any source
    pub fn fulltext(data: impl Into<Bytes>) -> Self {
        let new_data: Bytes = data.into();
        let len = new_data.len();
        Self {
            sview_offset: 0,
            sview_len: 0,
            tview_len: len,
            ops: if len == 0 { Vec::new() } else { vec![DeltaOp::New { len }] },
            new_data,
        }
    }

    /// Whether any instruction reads the source view
    pub fn reads_source(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, DeltaOp::Source { .. }))
    }

    /// Check every instruction stays inside its view
    fn validate(&self) -> Result<()> {
        let mut produced = 0usize;
        let mut new_pos = 0usize;
        for op in &self.ops {
            match *op {
                DeltaOp::Source { offset, len } => {
                    if offset.checked_add(len).is_none_or(|end| end > self.sview_len) {
                        return Err(corrupt("source copy outside the source view"));
                    }
                    produced += len;
                }
                DeltaOp::Target { offset, len } => {
                    if offset >= produced {
                        return Err(corrupt("target copy from beyond the produced text"));
                    }
                    produced += len;
                }
                DeltaOp::New { len } => {
                    new_pos += len;
                    if new_pos > self.new_data.len() {
                        return Err(corrupt("new-data copy past the end of new data"));
                    }
                    produced += len;
                }
            }
        }
        if produced != self.tview_len {
            return Err(corrupt("instructions do not fill the target view"));
        }
        Ok(())
    }

    /// Produce this window's target text from its source view
    pub fn apply(&self, source_view: &[u8]) -> Result<Vec<u8>> {
        if source_view.len() < self.sview_len && self.reads_source() {
            return Err(corrupt("source view shorter than the window expects"));
        }
        let mut out = Vec::with_capacity(self.tview_len);
        let mut new_pos = 0usize;
        for op in &self.ops {
            match *op {
                DeltaOp::Source { offset, len } => {
                    let slice = source_view
                        .get(offset..offset + len)
                        .ok_or_else(|| corrupt("source copy outside the source view"))?;
                    out.extend_from_slice(slice);
                }
                DeltaOp::Target { offset, len } => {
                    if offset >= out.len() {
                        return Err(corrupt("target copy from beyond the produced text"));
                    }
                    // Overlapping copies repeat the pattern, so go byte by byte.
                    for i in 0..len {
                        let b = out[offset + i];
                        out.push(b);
                    }
                }
                DeltaOp::New { len } => {
                    let slice = self
                        .new_data
                        .get(new_pos..new_pos + len)
                        .ok_or_else(|| corrupt("new-data copy past the end of new data"))?;
                    out.extend_from_slice(slice);
                    new_pos += len;
                }
            }
        }
        if out.len() != self.tview_len {
            return Err(corrupt("window produced the wrong length"));
        }
        Ok(out)
    }
}

fn corrupt(detail: &str) -> FsError {
    FsError::Svndiff(detail.to_string())
}

/// Read a varint at `pos`; `None` when the data ends mid-number
pub fn read_varint(data: &[u8], pos: usize) -> Result<Option<(u64, usize)>> {
    let mut result: u64 = 0;
    let mut p = pos;
    loop {
        if p - pos >= MAX_VARINT_LEN {
            return Err(corrupt("varint too long"));
        }
        let Some(&byte) = data.get(p) else {
            return Ok(None);
        };
        result = (result << 7) | (byte & 0x7f) as u64;
        p += 1;
        if byte & 0x80 == 0 {
            return Ok(Some((result, p)));
        }
    }
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; MAX_VARINT_LEN];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | cont);
    }
}

fn write_op(out: &mut Vec<u8>, code: u8, len: usize) {
    if len > 0 && len < 0x40 {
        out.push((code << 6) | len as u8);
    } else {
        out.push(code << 6);
        write_varint(out, len as u64);
    }
}

/// Encode one window (without the stream header)
pub fn encode_window(window: &TxDeltaWindow, out: &mut Vec<u8>) {
    let mut instructions = Vec::new();
    for op in &window.ops {
        match *op {
            DeltaOp::Source { offset, len } => {
                write_op(&mut instructions, 0, len);
                write_varint(&mut instructions, offset as u64);
            }
            DeltaOp::Target { offset, len } => {
                write_op(&mut instructions, 1, len);
                write_varint(&mut instructions, offset as u64);
            }
            DeltaOp::New { len } => write_op(&mut instructions, 2, len),
        }
    }
    write_varint(out, window.sview_offset);
    write_varint(out, window.sview_len as u64);
    write_varint(out, window.tview_len as u64);
    write_varint(out, instructions.len() as u64);
    write_varint(out, window.new_data.len() as u64);
    out.extend_from_slice(&instructions);
    out.extend_from_slice(&window.new_data);
}

/// Encode a complete delta stream
pub fn encode(windows: &[TxDeltaWindow]) -> Vec<u8> {
    let mut out = HEADER.to_vec();
    for w in windows {
        encode_window(w, &mut out);
    }
    out
}

fn parse_instructions(data: &[u8]) -> Result<Vec<DeltaOp>> {
    let mut ops = Vec::new();
    let mut pos = 0;
    let varint = |pos: usize| -> Result<(u64, usize)> {
        read_varint(data, pos)?.ok_or_else(|| corrupt("truncated instruction"))
    };
    while pos < data.len() {
        let byte = data[pos];
        pos += 1;
        let mut len = (byte & 0x3f) as usize;
        if len == 0 {
            let (l, p) = varint(pos)?;
            len = l as usize;
            pos = p;
        }
        let op = match byte >> 6 {
            0 | 1 => {
                let (offset, p) = varint(pos)?;
                pos = p;
                let offset = offset as usize;
                if byte >> 6 == 0 {
                    DeltaOp::Source { offset, len }
                } else {
                    DeltaOp::Target { offset, len }
                }
            }
            2 => DeltaOp::New { len },
            _ => return Err(corrupt("invalid instruction opcode")),
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Incremental svndiff parser accepting arbitrary chunk boundaries
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
    header_seen: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes; returns every window completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TxDeltaWindow>> {
        self.buf.extend_from_slice(chunk);
        if !self.header_seen {
            if self.buf.len() < HEADER.len() {
                return Ok(Vec::new());
            }
            if &self.buf[..3] != b"SVN" {
                return Err(corrupt("svndiff has invalid header"));
            }
            if self.buf[3] != 0 {
                return Err(corrupt("unsupported svndiff version"));
            }
            self.buf.advance(HEADER.len());
            self.header_seen = true;
        }
        let mut windows = Vec::new();
        while let Some(window) = self.next_window()? {
            windows.push(window);
        }
        Ok(windows)
    }

    fn next_window(&mut self) -> Result<Option<TxDeltaWindow>> {
        let mut pos = 0;
        let mut fields = [0u64; 5];
        for field in fields.iter_mut() {
            match read_varint(&self.buf, pos)? {
                Some((v, p)) => {
                    *field = v;
                    pos = p;
                }
                None => return Ok(None),
            }
        }
        let [sview_offset, sview_len, tview_len, ins_len, new_len] = fields;
        let total = (ins_len as usize)
            .checked_add(new_len as usize)
            .and_then(|n| n.checked_add(pos))
            .ok_or_else(|| corrupt("window lengths overflow"))?;
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total).freeze();
        frame.advance(pos);
        let instructions = frame.split_to(ins_len as usize);
        let window = TxDeltaWindow {
            sview_offset,
            sview_len: sview_len as usize,
            tview_len: tview_len as usize,
            ops: parse_instructions(&instructions)?,
            new_data: frame,
        };
        window.validate()?;
        Ok(Some(window))
    }

    /// Check the stream ended on a window boundary
    pub fn finish(&self) -> Result<()> {
        if !self.header_seen {
            return Err(corrupt("svndiff data ended before the header"));
        }
        if !self.buf.is_empty() {
            return Err(corrupt("svndiff data ended inside a window"));
        }
        Ok(())
    }
}

/// Decode a complete delta stream
pub fn decode(data: &[u8]) -> Result<Vec<TxDeltaWindow>> {
    let mut decoder = Decoder::new();
    let windows = decoder.feed(data)?;
    decoder.finish()?;
    Ok(windows)
}

/// Apply windows in order against `source`, producing the target text
pub fn apply(source: &[u8], windows: &[TxDeltaWindow]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for w in windows {
        out.extend_from_slice(&w.apply(source_view(source, w)?)?);
    }
    Ok(out)
}

/// The slice of `source` a window's source view covers
pub fn source_view<'a>(source: &'a [u8], window: &TxDeltaWindow) -> Result<&'a [u8]> {
    if window.sview_len == 0 {
        return Ok(&[]);
    }
    let start = window.sview_offset as usize;
    source
        .get(start..start + window.sview_len)
        .ok_or_else(|| corrupt("source view outside the source text"))
}

/// Cut `target` into windows of pure new data
pub fn fulltext_windows(target: &[u8], window_size: usize) -> Vec<TxDeltaWindow> {
    if target.is_empty() {
        return vec![TxDeltaWindow::fulltext(Bytes::new())];
    }
    target
        .chunks(window_size.max(1))
        .map(|c| TxDeltaWindow::fulltext(Bytes::copy_from_slice(c)))
        .collect()
}

/// Compute windows turning `source` into `target`.
///
/// Window `i` covers `target[i*ws..]` and uses `source[i*ws..]` as its
/// source view; matches are found by hashing 8-byte blocks of the view.
pub fn delta(source: &[u8], target: &[u8], window_size: usize) -> Vec<TxDeltaWindow> {
    let ws = window_size.max(1);
    if target.is_empty() {
        return vec![TxDeltaWindow::fulltext(Bytes::new())];
    }
    target
        .chunks(ws)
        .enumerate()
        .map(|(i, t)| {
            let start = (i * ws).min(source.len());
            let end = (start + ws).min(source.len());
            delta_window(&source[start..end], start as u64, t)
        })
        .collect()
}

fn block_key(data: &[u8]) -> u64 {
    let mut buf = [0u8; MATCH_BLOCK];
    buf.copy_from_slice(&data[..MATCH_BLOCK]);
    u64::from_le_bytes(buf)
}

fn delta_window(sview: &[u8], sview_offset: u64, target: &[u8]) -> TxDeltaWindow {
    let mut index: HashMap<u64, usize> = HashMap::new();
    if sview.len() >= MATCH_BLOCK {
        for pos in 0..=sview.len() - MATCH_BLOCK {
            index.entry(block_key(&sview[pos..])).or_insert(pos);
        }
    }

    let mut ops = Vec::new();
    let mut new_data = Vec::new();
    let mut pending = 0usize;
    let mut p = 0usize;
    let mut used_source = false;
    while p < target.len() {
        let found = if p + MATCH_BLOCK <= target.len() {
            index.get(&block_key(&target[p..])).copied()
        } else {
            None
        };
        let Some(s) = found.filter(|&s| sview[s..s + MATCH_BLOCK] == target[p..p + MATCH_BLOCK]) else {
            new_data.push(target[p]);
            pending += 1;
            p += 1;
            continue;
        };
        let mut len = MATCH_BLOCK;
        while s + len < sview.len() && p + len < target.len() && sview[s + len] == target[p + len] {
            len += 1;
        }
        if pending > 0 {
            ops.push(DeltaOp::New { len: pending });
            pending = 0;
        }
        ops.push(DeltaOp::Source { offset: s, len });
        used_source = true;
        p += len;
    }
    if pending > 0 {
        ops.push(DeltaOp::New { len: pending });
    }

    let (sview_offset, sview_len) = if used_source { (sview_offset, sview.len()) } else { (0, 0) };
    TxDeltaWindow {
        sview_offset,
        sview_len,
        tview_len: target.len(),
        ops,
        new_data: Bytes::from(new_data),
    }
}
