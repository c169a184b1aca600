//! Changed-path records
//!
//! Every mutation appends a change under `<txn-id>/<sequence>`. Committed
//! transactions keep their changes, so a revision's changed paths are found
//! through the transaction ID recorded in the revision.

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, Change, ChangeKind};
use crate::skel::Skel;
use std::collections::BTreeMap;

fn prefix(txn_id: &str) -> String {
    format!("{}/", txn_id)
}

pub fn add_change(trail: &Trail<'_>, txn_id: &str, change: &Change) -> Result<()> {
    let seq = trail.scan_prefix(Table::Changes, prefix(txn_id).as_bytes())?.len();
    let key = format!("{}{:020}", prefix(txn_id), seq);
    trail.put(Table::Changes, key.as_bytes(), &records::unparse_change(change).unparse())
}

/// Raw change records in the order they were made
pub fn txn_changes(trail: &Trail<'_>, txn_id: &str) -> Result<Vec<Change>> {
    if txn_id.is_empty() {
        return Ok(Vec::new());
    }
    trail
        .scan_prefix(Table::Changes, prefix(txn_id).as_bytes())?
        .into_iter()
        .map(|(_, v)| {
            let skel = Skel::parse(v).ok_or(FsError::malformed("change"))?;
            records::parse_change(&skel)
        })
        .collect()
}

pub fn delete_changes(trail: &Trail<'_>, txn_id: &str) -> Result<()> {
    trail.delete_prefix(Table::Changes, prefix(txn_id).as_bytes())?;
    Ok(())
}

fn is_below(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Fold a sequence of changes into one summary per path
pub fn fold_changes(changes: &[Change]) -> BTreeMap<String, Change> {
    let mut folded: BTreeMap<String, Change> = BTreeMap::new();
    for change in changes {
        if change.kind == ChangeKind::Delete || change.kind == ChangeKind::Replace {
            // Whatever happened below a deleted or replaced path is moot.
            folded.retain(|p, _| !is_below(p, &change.path));
        }
        let merged = match folded.remove(&change.path) {
            None => Some(change.clone()),
            Some(prev) => match (prev.kind, change.kind) {
                // Added in this transaction and deleted again: nothing happened.
                (ChangeKind::Add, ChangeKind::Delete) => None,
                (ChangeKind::Delete, ChangeKind::Add) | (_, ChangeKind::Replace) => Some(Change {
                    kind: ChangeKind::Replace,
                    ..change.clone()
                }),
                (_, ChangeKind::Delete) => Some(Change {
                    kind: ChangeKind::Delete,
                    ..change.clone()
                }),
                (kind, _) => Some(Change {
                    kind,
                    id: change.id.clone().or(prev.id),
                    text_mod: prev.text_mod || change.text_mod,
                    prop_mod: prev.prop_mod || change.prop_mod,
                    path: change.path.clone(),
                }),
            },
        };
        if let Some(c) = merged {
            folded.insert(c.path.clone(), c);
        }
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, kind: ChangeKind, text_mod: bool, prop_mod: bool) -> Change {
        Change {
            path: path.into(),
            id: None,
            kind,
            text_mod,
            prop_mod,
        }
    }

    #[test]
    fn test_fold_modifications() {
        let folded = fold_changes(&[
            change("/a", ChangeKind::Add, true, false),
            change("/a", ChangeKind::Modify, false, true),
            change("/b", ChangeKind::Modify, true, false),
            change("/b", ChangeKind::Modify, false, true),
        ]);
        assert_eq!(folded["/a"].kind, ChangeKind::Add);
        assert!(folded["/a"].text_mod && folded["/a"].prop_mod);
        assert_eq!(folded["/b"].kind, ChangeKind::Modify);
        assert!(folded["/b"].text_mod && folded["/b"].prop_mod);
    }

    #[test]
    fn test_fold_add_delete_replace() {
        let folded = fold_changes(&[
            change("/a", ChangeKind::Add, false, false),
            change("/a/x", ChangeKind::Add, true, false),
            change("/a", ChangeKind::Delete, false, false),
            change("/b", ChangeKind::Delete, false, false),
            change("/b", ChangeKind::Add, false, false),
            change("/ab", ChangeKind::Modify, true, false),
        ]);
        assert!(!folded.contains_key("/a"));
        assert!(!folded.contains_key("/a/x"));
        assert_eq!(folded["/b"].kind, ChangeKind::Replace);
        assert!(folded.contains_key("/ab"));
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("/a/b", "/a"));
        assert!(!is_below("/ab", "/a"));
        assert!(!is_below("/a", "/a"));
        assert!(is_below("/a", "/"));
    }
}
