//! Per-transaction clone and rename tracking
//!
//! Keys are the transaction ID followed by the base path (`3/trunk/a`). A
//! `cloned` record says the path's node has already been copied-on-write in
//! this transaction; a `moved` record says the node that lived at the path
//! now sits under another directory clone with a new entry name.
//!
//! Overwrite rules:
//! - `cloned` over `cloned` with the same ID is a no-op
//! - `cloned` over `cloned` with a different ID is corruption
//! - `moved` over `moved` replaces it
//! - `cloned` and `moved` never replace each other; the old record must be
//!   deleted first

use crate::error::{FsError, Result};
use crate::id::Id;
use crate::kv::{Table, Trail};
use crate::records::{self, CloneInfo};
use crate::skel::Skel;

fn clone_key(txn_id: &str, path: &str) -> String {
    format!("{}{}", txn_id, path)
}

pub fn get_clone(trail: &Trail<'_>, txn_id: &str, path: &str) -> Result<Option<CloneInfo>> {
    let Some(data) = trail.get(Table::Clones, clone_key(txn_id, path).as_bytes())? else {
        return Ok(None);
    };
    let skel = Skel::parse(data).ok_or(FsError::malformed("clone"))?;
    records::parse_clone(&skel).map(Some)
}

fn put_clone(trail: &Trail<'_>, key: &str, info: &CloneInfo) -> Result<()> {
    trail.put(Table::Clones, key.as_bytes(), &records::unparse_clone(info).unparse())
}

fn conflict(key: &str, existing: &CloneInfo, new: &CloneInfo) -> FsError {
    FsError::CloneConflict {
        key: key.to_string(),
        detail: format!("cannot record {:?} over {:?}", new, existing),
    }
}

/// Record that `path` has been cloned to `id` in this transaction
pub fn set_cloned(trail: &Trail<'_>, txn_id: &str, path: &str, id: &Id) -> Result<()> {
    let key = clone_key(txn_id, path);
    let new = CloneInfo::Cloned(id.clone());
    match get_clone(trail, txn_id, path)? {
        None => put_clone(trail, &key, &new),
        Some(CloneInfo::Cloned(existing)) if existing == *id => Ok(()),
        Some(existing) => Err(conflict(&key, &existing, &new)),
    }
}

/// Record that the node at `path` now lives under `parent` as `name`
pub fn set_moved(trail: &Trail<'_>, txn_id: &str, path: &str, parent: &Id, name: &str) -> Result<()> {
    let key = clone_key(txn_id, path);
    let new = CloneInfo::Moved {
        parent: parent.clone(),
        name: name.to_string(),
    };
    match get_clone(trail, txn_id, path)? {
        None | Some(CloneInfo::Moved { .. }) => put_clone(trail, &key, &new),
        Some(existing) => Err(conflict(&key, &existing, &new)),
    }
}

pub fn delete_clone(trail: &Trail<'_>, txn_id: &str, path: &str) -> Result<()> {
    trail.delete(Table::Clones, clone_key(txn_id, path).as_bytes())?;
    Ok(())
}

/// Drop the records for `path` and everything below it
pub fn delete_subtree(trail: &Trail<'_>, txn_id: &str, path: &str) -> Result<()> {
    delete_clone(trail, txn_id, path)?;
    let prefix = if path == "/" {
        clone_key(txn_id, "/")
    } else {
        format!("{}/", clone_key(txn_id, path))
    };
    trail.delete_prefix(Table::Clones, prefix.as_bytes())?;
    Ok(())
}

/// Drop every record of a transaction
pub fn delete_txn_clones(trail: &Trail<'_>, txn_id: &str) -> Result<()> {
    trail.delete_prefix(Table::Clones, format!("{}/", txn_id).as_bytes())?;
    Ok(())
}
