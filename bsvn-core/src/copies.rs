//! Copy history records

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, Copy};
use crate::skel::Skel;

/// Record a copy; returns the new copy ID
pub fn add_copy(trail: &Trail<'_>, copy: &Copy) -> Result<String> {
    let key = trail.next_key("copies")?;
    trail.put(Table::Copies, key.as_bytes(), &records::unparse_copy(copy).unparse())?;
    Ok(key)
}

pub fn get_copy(trail: &Trail<'_>, copy_id: &str) -> Result<Copy> {
    let data = trail
        .get(Table::Copies, copy_id.as_bytes())?
        .ok_or_else(|| FsError::NoSuchCopy(copy_id.to_string()))?;
    let skel = Skel::parse(data).ok_or(FsError::malformed("copy"))?;
    records::parse_copy(&skel)
}

pub fn delete_copy(trail: &Trail<'_>, copy_id: &str) -> Result<()> {
    if !trail.delete(Table::Copies, copy_id.as_bytes())? {
        return Err(FsError::NoSuchCopy(copy_id.to_string()));
    }
    Ok(())
}

/// Every copy record, keyed by copy ID
pub fn all_copies(trail: &Trail<'_>) -> Result<Vec<(String, Copy)>> {
    trail
        .scan_prefix(Table::Copies, b"")?
        .into_iter()
        .map(|(k, v)| {
            let id = String::from_utf8(k).map_err(|_| FsError::malformed("copy"))?;
            let skel = Skel::parse(v).ok_or(FsError::malformed("copy"))?;
            Ok((id, records::parse_copy(&skel)?))
        })
        .collect()
}
