//! Strings and representations
//!
//! A string is a blob of bytes under a base-36 key. A representation says how
//! to rebuild some text: either one string holding the fulltext, or a list of
//! svndiff windows each stored in its own string and applied against another
//! representation. Every delta window carries the MD5 of the text it
//! produces, checked on every read.

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, DeltaChunk, RepBody, Representation};
use crate::skel::Skel;
use crate::svndiff;
use std::collections::HashMap;
use tracing::debug;

// ---- strings ----

pub fn get_string(trail: &Trail<'_>, key: &str) -> Result<Vec<u8>> {
    trail
        .get(Table::Strings, key.as_bytes())?
        .ok_or_else(|| FsError::NoSuchString(key.to_string()))
}

/// Store `data` under a fresh string key
pub fn new_string(trail: &Trail<'_>, data: &[u8]) -> Result<String> {
    let key = trail.next_key("strings")?;
    trail.put(Table::Strings, key.as_bytes(), data)?;
    Ok(key)
}

pub fn delete_string(trail: &Trail<'_>, key: &str) -> Result<()> {
    trail.delete(Table::Strings, key.as_bytes())?;
    Ok(())
}

// ---- representations ----

pub fn get_rep(trail: &Trail<'_>, key: &str) -> Result<Representation> {
    let data = trail
        .get(Table::Representations, key.as_bytes())?
        .ok_or_else(|| FsError::NoSuchRepresentation(key.to_string()))?;
    let skel = Skel::parse(data).ok_or(FsError::malformed("representation"))?;
    records::parse_representation(&skel)
}

pub fn put_rep(trail: &Trail<'_>, key: &str, rep: &Representation) -> Result<()> {
    trail.put(
        Table::Representations,
        key.as_bytes(),
        &records::unparse_representation(rep).unparse(),
    )
}

/// Store `data` as a new fulltext representation
pub fn write_rep(trail: &Trail<'_>, data: &[u8], mutable: bool) -> Result<String> {
    let string_key = if data.is_empty() { None } else { Some(new_string(trail, data)?) };
    let key = trail.next_key("representations")?;
    put_rep(trail, &key, &Representation::fulltext(string_key, mutable))?;
    Ok(key)
}

/// Delete a representation and the strings it owns
pub fn delete_rep(trail: &Trail<'_>, key: &str) -> Result<()> {
    let rep = get_rep(trail, key)?;
    delete_rep_strings(trail, &rep)?;
    trail.delete(Table::Representations, key.as_bytes())?;
    Ok(())
}

fn delete_rep_strings(trail: &Trail<'_>, rep: &Representation) -> Result<()> {
    match &rep.body {
        RepBody::Fulltext(Some(s)) => delete_string(trail, s)?,
        RepBody::Fulltext(None) => {}
        RepBody::Delta(chunks) => {
            for c in chunks {
                delete_string(trail, &c.diff_key)?;
            }
        }
    }
    Ok(())
}

/// Delete `key` if it names a mutable representation; committed
/// representations may be shared and are left alone.
pub fn delete_rep_if_mutable(trail: &Trail<'_>, key: &str) -> Result<()> {
    if get_rep(trail, key)?.mutable {
        delete_rep(trail, key)?;
    }
    Ok(())
}

/// Replace the contents behind a node's representation key.
///
/// A mutable representation is rewritten in place; otherwise a new mutable
/// representation is created. Returns the key to store in the node.
pub fn set_rep_contents(trail: &Trail<'_>, old: Option<&str>, data: &[u8]) -> Result<String> {
    if let Some(key) = old {
        let rep = get_rep(trail, key)?;
        if rep.mutable {
            delete_rep_strings(trail, &rep)?;
            let string_key = if data.is_empty() { None } else { Some(new_string(trail, data)?) };
            put_rep(trail, key, &Representation::fulltext(string_key, true))?;
            return Ok(key.to_string());
        }
    }
    write_rep(trail, data, true)
}

/// Mark a representation immutable; returns whether it changed
pub fn freeze_rep(trail: &Trail<'_>, key: &str) -> Result<bool> {
    let mut rep = get_rep(trail, key)?;
    if !rep.mutable {
        return Ok(false);
    }
    rep.mutable = false;
    put_rep(trail, key, &rep)?;
    Ok(true)
}

/// Length of the text a representation produces, without rebuilding it
pub fn rep_length(trail: &Trail<'_>, key: &str) -> Result<u64> {
    match get_rep(trail, key)?.body {
        RepBody::Fulltext(None) => Ok(0),
        RepBody::Fulltext(Some(s)) => Ok(get_string(trail, &s)?.len() as u64),
        RepBody::Delta(chunks) => Ok(chunks.last().map_or(0, |c| c.offset + c.size)),
    }
}

/// Rebuild the full text of a representation
pub fn read_rep(trail: &Trail<'_>, key: &str) -> Result<Vec<u8>> {
    let mut bases = HashMap::new();
    read_rep_with(trail, key, &mut bases, 0)
}

/// Chains longer than this mean a cycle slipped in
const MAX_DELTA_DEPTH: usize = 1000;

fn read_rep_with(
    trail: &Trail<'_>,
    key: &str,
    bases: &mut HashMap<String, Vec<u8>>,
    depth: usize,
) -> Result<Vec<u8>> {
    if depth > MAX_DELTA_DEPTH {
        return Err(FsError::CorruptRepresentation {
            key: key.to_string(),
            detail: "delta chain too deep".into(),
        });
    }
    match get_rep(trail, key)?.body {
        RepBody::Fulltext(None) => Ok(Vec::new()),
        RepBody::Fulltext(Some(s)) => get_string(trail, &s),
        RepBody::Delta(chunks) => {
            let mut out = Vec::new();
            for chunk in &chunks {
                if chunk.offset != out.len() as u64 {
                    return Err(FsError::CorruptRepresentation {
                        key: key.to_string(),
                        detail: format!("chunk at offset {} follows {} bytes", chunk.offset, out.len()),
                    });
                }
                let text = read_chunk(trail, key, chunk, bases, depth)?;
                out.extend_from_slice(&text);
            }
            Ok(out)
        }
    }
}

fn read_chunk(
    trail: &Trail<'_>,
    key: &str,
    chunk: &DeltaChunk,
    bases: &mut HashMap<String, Vec<u8>>,
    depth: usize,
) -> Result<Vec<u8>> {
    let windows = svndiff::decode(&get_string(trail, &chunk.diff_key)?)?;
    let source: &[u8] = match &chunk.base_rep_key {
        Some(base) => {
            if !bases.contains_key(base) {
                let text = read_rep_with(trail, base, bases, depth + 1)?;
                bases.insert(base.clone(), text);
            }
            bases.get(base).map(Vec::as_slice).unwrap_or_default()
        }
        None => &[],
    };
    let text = svndiff::apply(source, &windows)?;
    if text.len() as u64 != chunk.size {
        return Err(FsError::CorruptRepresentation {
            key: key.to_string(),
            detail: format!("window produced {} bytes, expected {}", text.len(), chunk.size),
        });
    }
    let digest = md5::compute(&text);
    if digest.0 != chunk.md5 {
        return Err(FsError::ChecksumMismatch {
            path: format!("representation {}", key),
            expected: hex::encode(chunk.md5),
            actual: hex::encode(digest.0),
        });
    }
    Ok(text)
}

/// Whether reading `key` ever consults `target`
fn depends_on(trail: &Trail<'_>, key: &str, target: &str, depth: usize) -> Result<bool> {
    if key == target {
        return Ok(true);
    }
    if depth > MAX_DELTA_DEPTH {
        return Ok(true);
    }
    if let RepBody::Delta(chunks) = get_rep(trail, key)?.body {
        for c in chunks {
            if let Some(base) = &c.base_rep_key {
                if depends_on(trail, base, target, depth + 1)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Rewrite the committed representation `target` as a delta against `base`.
///
/// Does nothing when the keys are equal, when `base` already depends on
/// `target`, or when the delta would not be smaller than what is stored now.
/// Returns whether the representation was rewritten.
pub fn deltify(trail: &Trail<'_>, target: &str, base: &str, window_size: usize) -> Result<bool> {
    if target == base || depends_on(trail, base, target, 0)? {
        return Ok(false);
    }
    let old = get_rep(trail, target)?;
    if old.mutable {
        return Err(FsError::RepNotMutable(target.to_string()));
    }
    let target_text = read_rep(trail, target)?;
    let base_text = read_rep(trail, base)?;

    let stored_size = match &old.body {
        RepBody::Fulltext(None) => return Ok(false),
        RepBody::Fulltext(Some(s)) => get_string(trail, s)?.len(),
        RepBody::Delta(chunks) => {
            let mut n = 0;
            for c in chunks {
                n += get_string(trail, &c.diff_key)?.len();
            }
            n
        }
    };

    let windows = svndiff::delta(&base_text, &target_text, window_size);
    let mut encoded = Vec::with_capacity(windows.len());
    let mut offset = 0u64;
    let mut total = 0usize;
    for w in &windows {
        let view = svndiff::source_view(&base_text, w)?;
        let text = w.apply(view)?;
        let bytes = svndiff::encode(std::slice::from_ref(w));
        total += bytes.len();
        encoded.push((offset, w.reads_source(), bytes, text.len() as u64, md5::compute(&text).0));
        offset += text.len() as u64;
    }
    if total >= stored_size {
        return Ok(false);
    }

    let mut chunks = Vec::with_capacity(encoded.len());
    for (offset, reads_source, bytes, size, md5) in encoded {
        chunks.push(DeltaChunk {
            offset,
            base_rep_key: reads_source.then(|| base.to_string()),
            diff_key: new_string(trail, &bytes)?,
            size,
            md5,
        });
    }
    delete_rep_strings(trail, &old)?;
    put_rep(
        trail,
        target,
        &Representation {
            mutable: false,
            body: RepBody::Delta(chunks),
        },
    )?;
    debug!("deltified representation {} against {} ({} -> {} bytes)", target, base, stored_size, total);
    Ok(true)
}
