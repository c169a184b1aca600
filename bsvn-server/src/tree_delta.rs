//! Drive an editor with the difference between two trees
//!
//! Editor paths are relative to the anchor, with no leading slash; the
//! anchor itself is the edit root. Unchanged subtrees are recognized by
//! node-revision ID and skipped without being read.

use bsvn_core::svndiff;
use bsvn_core::tree::join_path;
use bsvn_core::{Filesystem, NodeKind, PropList, Revnum, Root};
use bsvn_ra::{Editor, Result, send_contents};
use bytes::Bytes;
use tracing::debug;

/// What to compare and how to describe it
pub struct DeltaParams<'a> {
    pub fs: &'a Filesystem,
    pub source: Root,
    pub source_anchor: String,
    pub target: Root,
    pub target_anchor: String,
    /// Restrict the edit to this entry of the anchor
    pub entry: Option<String>,
    /// Where the entry lives in the target tree, when not under the target anchor
    pub entry_target: Option<String>,
    /// Descend into subdirectories
    pub recurse: bool,
    /// Send file contents; otherwise only announce that text changed
    pub text_deltas: bool,
    /// Treat unrelated nodes of the same kind as modifications
    pub ignore_ancestry: bool,
    /// Checkpoint called between entries; an error stops the walk
    pub cancel: &'a dyn Fn() -> Result<()>,
}

fn edit_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn prop_changes(old: &PropList, new: &PropList) -> Vec<(String, Option<Bytes>)> {
    let mut changes = Vec::new();
    for name in old.keys() {
        if !new.contains_key(name) {
            changes.push((name.clone(), None));
        }
    }
    for (name, value) in new {
        if old.get(name) != Some(value) {
            changes.push((name.clone(), Some(value.clone())));
        }
    }
    changes
}

/// Run the whole edit: target revision, root, changes, close.
///
/// If the walk fails the edit is aborted before the error is returned.
pub fn drive_tree_delta<E: Editor>(
    p: &DeltaParams<'_>,
    editor: &mut E,
    target_rev: Option<Revnum>,
    base_rev: Option<Revnum>,
) -> Result<()> {
    let result = walk(p, editor, target_rev, base_rev);
    if let Err(e) = &result {
        debug!("tree delta failed: {}", e);
        if !matches!(e, bsvn_ra::RaError::ConnectionClosed | bsvn_ra::RaError::Io(_)) {
            if let Err(abort) = editor.abort_edit() {
                debug!("abort-edit not delivered: {}", abort);
            }
        }
    }
    result
}

fn walk<E: Editor>(p: &DeltaParams<'_>, editor: &mut E, target_rev: Option<Revnum>, base_rev: Option<Revnum>) -> Result<()> {
    (p.cancel)()?;
    if let Some(rev) = target_rev {
        editor.set_target_revision(rev)?;
    }
    let mut root = editor.open_root(base_rev)?;
    match &p.entry {
        None => delta_dirs(p, editor, &mut root, &p.source_anchor, &p.target_anchor, "")?,
        Some(name) => {
            let source = join_path(&p.source_anchor, name);
            let target = p
                .entry_target
                .clone()
                .unwrap_or_else(|| join_path(&p.target_anchor, name));
            delta_entry(p, editor, &mut root, &source, &target, name)?;
        }
    }
    editor.close_directory(root)?;
    editor.close_edit()
}

fn kind_at(fs: &Filesystem, root: &Root, path: &str) -> Result<Option<NodeKind>> {
    Ok(fs.check_path(root, path)?)
}

fn delta_entry<E: Editor>(
    p: &DeltaParams<'_>,
    editor: &mut E,
    parent: &mut E::Dir,
    source: &str,
    target: &str,
    path: &str,
) -> Result<()> {
    let src_kind = kind_at(p.fs, &p.source, source)?;
    let tgt_kind = kind_at(p.fs, &p.target, target)?;
    match (src_kind, tgt_kind) {
        (None, None) => Ok(()),
        (Some(_), None) => editor.delete_entry(path, None, parent),
        (None, Some(kind)) => add_node(p, editor, parent, target, path, kind),
        (Some(sk), Some(tk)) => {
            let src_id = p.fs.node_id(&p.source, source)?;
            let tgt_id = p.fs.node_id(&p.target, target)?;
            if src_id == tgt_id {
                return Ok(());
            }
            let related = sk == tk && (p.ignore_ancestry || src_id.same_node(&tgt_id));
            if !related {
                editor.delete_entry(path, None, parent)?;
                return add_node(p, editor, parent, target, path, tk);
            }
            let base_rev = p.fs.node_created_rev(&p.source, source)?;
            match tk {
                NodeKind::Dir => {
                    let mut dir = editor.open_directory(path, parent, base_rev)?;
                    delta_dirs(p, editor, &mut dir, source, target, path)?;
                    editor.close_directory(dir)
                }
                NodeKind::File => {
                    let mut file = editor.open_file(path, parent, base_rev)?;
                    delta_file(p, editor, &mut file, Some(source), target)?;
                    let checksum = hex::encode(p.fs.file_md5(&p.target, target)?);
                    editor.close_file(file, Some(&checksum))
                }
            }
        }
    }
}

fn delta_dirs<E: Editor>(
    p: &DeltaParams<'_>,
    editor: &mut E,
    dir: &mut E::Dir,
    source: &str,
    target: &str,
    path: &str,
) -> Result<()> {
    let old = p.fs.node_proplist(&p.source, source)?;
    let new = p.fs.node_proplist(&p.target, target)?;
    for (name, value) in prop_changes(&old, &new) {
        editor.change_dir_prop(dir, &name, value.as_deref())?;
    }

    let src_entries = p.fs.dir_entries(&p.source, source)?;
    let tgt_entries = p.fs.dir_entries(&p.target, target)?;

    for name in src_entries.keys().filter(|n| !tgt_entries.contains_key(*n)) {
        (p.cancel)()?;
        let src_child = join_path(source, name);
        if !p.recurse && kind_at(p.fs, &p.source, &src_child)? == Some(NodeKind::Dir) {
            continue;
        }
        editor.delete_entry(&edit_path(path, name), None, dir)?;
    }

    for (name, tgt_id) in &tgt_entries {
        (p.cancel)()?;
        if src_entries.get(name) == Some(tgt_id) {
            continue;
        }
        let src_child = join_path(source, name);
        let tgt_child = join_path(target, name);
        if !p.recurse {
            let is_dir = kind_at(p.fs, &p.target, &tgt_child)? == Some(NodeKind::Dir)
                || kind_at(p.fs, &p.source, &src_child)? == Some(NodeKind::Dir);
            if is_dir {
                continue;
            }
        }
        delta_entry(p, editor, dir, &src_child, &tgt_child, &edit_path(path, name))?;
    }
    Ok(())
}

fn add_node<E: Editor>(
    p: &DeltaParams<'_>,
    editor: &mut E,
    parent: &mut E::Dir,
    target: &str,
    path: &str,
    kind: NodeKind,
) -> Result<()> {
    (p.cancel)()?;
    let props = p.fs.node_proplist(&p.target, target)?;
    match kind {
        NodeKind::Dir => {
            let mut dir = editor.add_directory(path, parent, None)?;
            for (name, value) in &props {
                editor.change_dir_prop(&mut dir, name, Some(&value[..]))?;
            }
            if p.recurse {
                for (name, child) in p.fs.dir_list(&p.target, target)? {
                    add_node(p, editor, &mut dir, &join_path(target, &name), &edit_path(path, &name), child.kind)?;
                }
            }
            editor.close_directory(dir)
        }
        NodeKind::File => {
            let mut file = editor.add_file(path, parent, None)?;
            for (name, value) in &props {
                editor.change_file_prop(&mut file, name, Some(&value[..]))?;
            }
            delta_file(p, editor, &mut file, None, target)?;
            let checksum = hex::encode(p.fs.file_md5(&p.target, target)?);
            editor.close_file(file, Some(&checksum))
        }
    }
}

fn delta_file<E: Editor>(
    p: &DeltaParams<'_>,
    editor: &mut E,
    file: &mut E::File,
    source: Option<&str>,
    target: &str,
) -> Result<()> {
    if let Some(source) = source {
        let old = p.fs.node_proplist(&p.source, source)?;
        let new = p.fs.node_proplist(&p.target, target)?;
        for (name, value) in prop_changes(&old, &new) {
            editor.change_file_prop(file, &name, value.as_deref())?;
        }
    }

    let tgt_md5 = p.fs.file_md5(&p.target, target)?;
    let (base, base_checksum) = match source {
        Some(source) => {
            let src_md5 = p.fs.file_md5(&p.source, source)?;
            if src_md5 == tgt_md5 {
                return Ok(());
            }
            (Some(source), Some(hex::encode(src_md5)))
        }
        None => (None, None),
    };
    if !p.text_deltas {
        return send_contents(editor, file, base_checksum.as_deref(), &[]);
    }
    let old = match base {
        Some(source) => p.fs.file_contents(&p.source, source)?,
        None => Vec::new(),
    };
    let new = p.fs.file_contents(&p.target, target)?;
    let windows = svndiff::delta(&old, &new, p.fs.config().delta_window_size);
    send_contents(editor, file, base_checksum.as_deref(), &windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsvn_core::Access;
    use std::collections::BTreeMap;

    /// Logs calls and rebuilds file texts against a map of base texts
    #[derive(Default)]
    struct Log {
        calls: Vec<String>,
        texts: BTreeMap<String, Vec<u8>>,
        pending: Vec<svndiff::TxDeltaWindow>,
    }

    impl Editor for Log {
        type Dir = String;
        type File = String;

        fn set_target_revision(&mut self, rev: Revnum) -> Result<()> {
            self.calls.push(format!("target {}", rev));
            Ok(())
        }
        fn open_root(&mut self, _base_rev: Option<Revnum>) -> Result<String> {
            self.calls.push("open-root".into());
            Ok(String::new())
        }
        fn delete_entry(&mut self, path: &str, _rev: Option<Revnum>, _parent: &mut String) -> Result<()> {
            self.calls.push(format!("delete {}", path));
            Ok(())
        }
        fn add_directory(&mut self, path: &str, _parent: &mut String, _copyfrom: Option<(&str, Revnum)>) -> Result<String> {
            self.calls.push(format!("add-dir {}", path));
            Ok(path.into())
        }
        fn open_directory(&mut self, path: &str, _parent: &mut String, _base_rev: Option<Revnum>) -> Result<String> {
            self.calls.push(format!("open-dir {}", path));
            Ok(path.into())
        }
        fn change_dir_prop(&mut self, dir: &mut String, name: &str, _value: Option<&[u8]>) -> Result<()> {
            self.calls.push(format!("dir-prop {} {}", dir, name));
            Ok(())
        }
        fn close_directory(&mut self, _dir: String) -> Result<()> {
            Ok(())
        }
        fn add_file(&mut self, path: &str, _parent: &mut String, _copyfrom: Option<(&str, Revnum)>) -> Result<String> {
            self.calls.push(format!("add-file {}", path));
            Ok(path.into())
        }
        fn open_file(&mut self, path: &str, _parent: &mut String, _base_rev: Option<Revnum>) -> Result<String> {
            self.calls.push(format!("open-file {}", path));
            Ok(path.into())
        }
        fn apply_textdelta(&mut self, _file: &mut String, _base: Option<&str>) -> Result<bool> {
            self.pending.clear();
            Ok(true)
        }
        fn textdelta_window(&mut self, file: &mut String, window: Option<&svndiff::TxDeltaWindow>) -> Result<()> {
            match window {
                Some(w) => self.pending.push(w.clone()),
                None => {
                    let base = self.texts.get(file.as_str()).cloned().unwrap_or_default();
                    let text = svndiff::apply(&base, &self.pending)?;
                    self.texts.insert(file.clone(), text);
                }
            }
            Ok(())
        }
        fn change_file_prop(&mut self, file: &mut String, name: &str, _value: Option<&[u8]>) -> Result<()> {
            self.calls.push(format!("file-prop {} {}", file, name));
            Ok(())
        }
        fn close_file(&mut self, _file: String, _checksum: Option<&str>) -> Result<()> {
            Ok(())
        }
        fn close_edit(&mut self) -> Result<()> {
            self.calls.push("close-edit".into());
            Ok(())
        }
        fn abort_edit(&mut self) -> Result<()> {
            self.calls.push("abort-edit".into());
            Ok(())
        }
    }

    fn no_cancel() -> Result<()> {
        Ok(())
    }

    fn params(fs: &Filesystem, from: Revnum, to: Revnum) -> DeltaParams<'_> {
        DeltaParams {
            fs,
            source: Root::Revision(from),
            source_anchor: "/".into(),
            target: Root::Revision(to),
            target_anchor: "/".into(),
            entry: None,
            entry_target: None,
            recurse: true,
            text_deltas: true,
            ignore_ancestry: false,
            cancel: &no_cancel,
        }
    }

    fn setup() -> Filesystem {
        let fs = Filesystem::create_in_memory().unwrap();
        let access = Access::new("harry");
        let txn = fs.begin_txn(0).unwrap();
        fs.make_dir(&txn, "/A").unwrap();
        fs.make_file(&txn, "/A/mu").unwrap();
        fs.set_file_contents(&txn, "/A/mu", b"This is the file 'mu'.\n").unwrap();
        fs.make_file(&txn, "/iota").unwrap();
        fs.set_file_contents(&txn, "/iota", b"This is the file 'iota'.\n").unwrap();
        fs.commit_txn(&txn, &access).unwrap();

        let txn = fs.begin_txn(1).unwrap();
        fs.set_file_contents(&txn, "/A/mu", b"This is the file 'mu'.\nAnd a second line.\n").unwrap();
        fs.delete(&txn, "/iota").unwrap();
        fs.make_dir(&txn, "/B").unwrap();
        fs.change_node_prop(&txn, "/B", "svn:ignore", Some(b"*.o")).unwrap();
        fs.commit_txn(&txn, &access).unwrap();
        fs
    }

    #[test]
    fn test_checkout_from_empty_tree() {
        let fs = setup();
        let mut log = Log::default();
        drive_tree_delta(&params(&fs, 0, 1), &mut log, Some(1), Some(0)).unwrap();
        assert_eq!(
            log.calls,
            vec!["target 1", "open-root", "add-dir A", "add-file A/mu", "add-file iota", "close-edit"]
        );
        assert_eq!(log.texts["A/mu"], b"This is the file 'mu'.\n");
    }

    #[test]
    fn test_update_sends_only_changes() {
        let fs = setup();
        let mut log = Log::default();
        log.texts.insert("A/mu".into(), b"This is the file 'mu'.\n".to_vec());
        drive_tree_delta(&params(&fs, 1, 2), &mut log, Some(2), Some(1)).unwrap();
        assert_eq!(
            log.calls,
            vec![
                "target 2",
                "open-root",
                "delete iota",
                "open-dir A",
                "open-file A/mu",
                "add-dir B",
                "dir-prop B svn:ignore",
                "close-edit",
            ]
        );
        assert_eq!(log.texts["A/mu"], b"This is the file 'mu'.\nAnd a second line.\n");
    }

    #[test]
    fn test_non_recursive_skips_directories() {
        let fs = setup();
        let mut log = Log::default();
        let mut p = params(&fs, 0, 1);
        p.recurse = false;
        drive_tree_delta(&p, &mut log, Some(1), Some(0)).unwrap();
        assert_eq!(log.calls, vec!["target 1", "open-root", "add-file iota", "close-edit"]);
    }

    #[test]
    fn test_entry_restriction() {
        let fs = setup();
        let mut log = Log::default();
        let mut p = params(&fs, 1, 2);
        p.entry = Some("iota".into());
        drive_tree_delta(&p, &mut log, Some(2), Some(1)).unwrap();
        assert_eq!(log.calls, vec!["target 2", "open-root", "delete iota", "close-edit"]);
    }

    #[test]
    fn test_cancelled_walk_aborts_edit() {
        let fs = setup();
        let mut log = Log::default();
        let cancel = || -> Result<()> { Err(bsvn_core::FsError::Cancelled.into()) };
        let mut p = params(&fs, 0, 1);
        p.cancel = &cancel;
        assert!(drive_tree_delta(&p, &mut log, Some(1), Some(0)).is_err());
        assert_eq!(log.calls, vec!["abort-edit"]);
    }
}
