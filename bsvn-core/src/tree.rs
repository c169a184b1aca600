//! Path-level tree operations
//!
//! Reads against revision and transaction roots, and every mutation a
//! transaction can make. Mutations copy nodes on write: the first change
//! below a committed directory clones each directory on the way down and
//! records the clone, so later changes in the same transaction reuse it.
//!
//! Committing merges the transaction against the youngest revision when the
//! two have diverged, checks locks, freezes every mutable node and
//! representation, then appends the revision.

use crate::changes;
use crate::clones;
use crate::copies;
use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::id::Id;
use crate::kv::{Table, Trail};
use crate::locks::{self, Access};
use crate::node::{self, Node};
use crate::records::{
    self, Change, ChangeKind, CloneInfo, Copy, Entries, NodeKind, NodeRevision, PropList, Revision, Transaction,
};
use crate::reps;
use crate::revs;
use crate::skel::Skel;
use crate::txn;
use crate::{PROP_REVISION_AUTHOR, PROP_REVISION_DATE, Revnum};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A tree to read from: a committed revision or an open transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    Revision(Revnum),
    Txn(String),
}

/// What a directory listing reports about one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub id: Id,
    pub kind: NodeKind,
    /// File length; zero for directories
    pub size: u64,
    pub has_props: bool,
    /// `None` for nodes not yet committed
    pub created_rev: Option<Revnum>,
    pub time: Option<String>,
    pub last_author: Option<String>,
}

/// Normalize `path` to `/a/b` form. `.` components and repeated slashes are
/// dropped; `..` is rejected.
pub fn canonicalize_path(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(FsError::PathSyntax(path.to_string())),
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Split a canonical path into its parent and last component
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) | None => ("/", path.trim_start_matches('/')),
        Some(i) => (&path[..i], &path[i + 1..]),
    }
}

/// Whether `path` is strictly below `dir`
pub fn is_below(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

fn change(path: &str, id: &Id, kind: ChangeKind, text_mod: bool, prop_mod: bool) -> Change {
    Change {
        path: path.to_string(),
        id: Some(id.clone()),
        kind,
        text_mod,
        prop_mod,
    }
}

// ---- trail-level helpers ----

impl Filesystem {
    pub(crate) fn root_id(&self, t: &Trail<'_>, root: &Root) -> Result<Id> {
        match root {
            Root::Revision(rev) => Ok(revs::get_revision(t, self.fs_path(), *rev)?.root_id),
            Root::Txn(txn_id) => Ok(txn::get_txn(t, txn_id)?.root_id),
        }
    }

    fn read_entries(&self, t: &Trail<'_>, noderev: &NodeRevision) -> Result<Entries> {
        let Some(key) = &noderev.data_key else {
            return Ok(Entries::new());
        };
        let skel = Skel::parse(reps::read_rep(t, key)?).ok_or(FsError::malformed("entries"))?;
        records::parse_entries(&skel)
    }

    fn read_props(&self, t: &Trail<'_>, noderev: &NodeRevision) -> Result<PropList> {
        let Some(key) = &noderev.prop_key else {
            return Ok(PropList::new());
        };
        let skel = Skel::parse(reps::read_rep(t, key)?).ok_or(FsError::malformed("proplist"))?;
        records::parse_proplist(&skel)
    }

    fn node_entries(&self, t: &Trail<'_>, node: &Node) -> Result<Entries> {
        let noderev = node.noderev(t, self.fs_path())?;
        if noderev.kind != NodeKind::Dir {
            return Err(FsError::NotDirectory(noderev.created_path));
        }
        self.read_entries(t, &noderev)
    }

    fn entries_of(&self, t: &Trail<'_>, id: &Id) -> Result<Entries> {
        let node = self.open_node(t, id)?;
        self.node_entries(t, &node)
    }

    /// The node at canonical `path` under `root`, if there is one
    pub(crate) fn lookup(&self, t: &Trail<'_>, root: &Root, path: &str) -> Result<Option<Arc<Node>>> {
        let mut node = self.open_node(t, &self.root_id(t, root)?)?;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            if !node.is_dir() {
                return Ok(None);
            }
            match self.node_entries(t, &node)?.get(name) {
                Some(id) => node = self.open_node(t, id)?,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    fn require(&self, t: &Trail<'_>, root: &Root, path: &str) -> Result<Arc<Node>> {
        self.lookup(t, root, path)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub(crate) fn kind_at(&self, t: &Trail<'_>, root: &Root, path: &str) -> Result<Option<NodeKind>> {
        Ok(self.lookup(t, root, path)?.map(|n| n.kind()))
    }

    fn dirent_of(&self, t: &Trail<'_>, node: &Node) -> Result<Dirent> {
        let noderev = node.noderev(t, self.fs_path())?;
        let size = match (&noderev.kind, &noderev.data_key) {
            (NodeKind::File, Some(key)) => reps::rep_length(t, key)?,
            _ => 0,
        };
        let has_props = !self.read_props(t, &noderev)?.is_empty();
        let (time, last_author) = match noderev.rev {
            Some(rev) => {
                let props = revs::rev_proplist(t, self.fs_path(), rev)?;
                let text = |name: &str| props.get(name).map(|v| String::from_utf8_lossy(v).into_owned());
                (text(PROP_REVISION_DATE), text(PROP_REVISION_AUTHOR))
            }
            None => (None, None),
        };
        Ok(Dirent {
            id: node.id().clone(),
            kind: noderev.kind,
            size,
            has_props,
            created_rev: noderev.rev,
            time,
            last_author,
        })
    }

    fn write_entries(&self, t: &Trail<'_>, txn_id: &str, dir_id: &Id, entries: &Entries) -> Result<()> {
        let mut noderev = node::get_node_revision(t, self.fs_path(), dir_id)?;
        if noderev.mutable_txn.as_deref() != Some(txn_id) {
            return Err(FsError::NotMutable(noderev.created_path));
        }
        let data = records::unparse_entries(entries).unparse();
        noderev.data_key = Some(reps::set_rep_contents(t, noderev.data_key.as_deref(), &data)?);
        node::put_node_revision(t, dir_id, &noderev)
    }

    /// Make a mutable successor of the committed node `id` for `path`
    fn clone_node(&self, t: &Trail<'_>, txn_id: &str, id: &Id, path: &str) -> Result<Id> {
        let mut noderev = node::get_node_revision(t, self.fs_path(), id)?;
        noderev.mutable_txn = Some(txn_id.to_string());
        noderev.predecessor = Some(id.clone());
        noderev.rev = None;
        noderev.created_path = path.to_string();
        let new_id = node::create_successor(t, id, &noderev)?;
        clones::set_cloned(t, txn_id, path, &new_id)?;
        debug!("cloned {} as {} for {}", id, new_id, path);
        Ok(new_id)
    }

    /// Make the node at `path` and every directory above it mutable in the
    /// transaction; returns the mutable node's ID.
    pub(crate) fn make_path_mutable(&self, t: &Trail<'_>, txn_id: &str, path: &str) -> Result<Id> {
        if path == "/" {
            let mut txn = txn::get_txn(t, txn_id)?;
            if self.open_node(t, &txn.root_id)?.is_mutable_in(txn_id) {
                return Ok(txn.root_id);
            }
            let new_id = self.clone_node(t, txn_id, &txn.root_id, "/")?;
            txn.root_id = new_id.clone();
            txn::put_txn(t, txn_id, &txn)?;
            return Ok(new_id);
        }
        if let Some(CloneInfo::Cloned(id)) = clones::get_clone(t, txn_id, path)? {
            return Ok(id);
        }
        let (parent, name) = split_path(path);
        let parent_id = self.make_path_mutable(t, txn_id, parent)?;
        let mut entries = self.entries_of(t, &parent_id)?;
        let child_id = entries
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if self.open_node(t, &child_id)?.is_mutable_in(txn_id) {
            return Ok(child_id);
        }
        let new_id = self.clone_node(t, txn_id, &child_id, path)?;
        entries.insert(name.to_string(), new_id.clone());
        self.write_entries(t, txn_id, &parent_id, &entries)?;
        Ok(new_id)
    }

    fn mutable_dir(&self, t: &Trail<'_>, txn_id: &str, path: &str) -> Result<Id> {
        let id = self.make_path_mutable(t, txn_id, path)?;
        if !self.open_node(t, &id)?.is_dir() {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        Ok(id)
    }

    /// Delete `id` and everything below it that is mutable in the transaction
    fn delete_mutable_tree(&self, t: &Trail<'_>, txn_id: &str, id: &Id) -> Result<()> {
        let noderev = node::get_node_revision(t, self.fs_path(), id)?;
        if noderev.mutable_txn.as_deref() != Some(txn_id) {
            return Ok(());
        }
        if noderev.kind == NodeKind::Dir {
            for child in self.read_entries(t, &noderev)?.values() {
                self.delete_mutable_tree(t, txn_id, child)?;
            }
        }
        for key in [&noderev.prop_key, &noderev.data_key].into_iter().flatten() {
            reps::delete_rep_if_mutable(t, key)?;
        }
        node::delete_node_revision(t, id)
    }

    /// Drop copy records whose destination node no longer exists
    fn sweep_copies(&self, t: &Trail<'_>) -> Result<()> {
        for (copy_id, copy) in copies::all_copies(t)? {
            if !t.exists(Table::Nodes, &copy.dst_id.to_key())? {
                copies::delete_copy(t, &copy_id)?;
            }
        }
        Ok(())
    }

    // ---- merge and commit ----

    /// Three-way merge of directory `source` into the mutable directory
    /// `target`, both descended from `ancestor`.
    fn merge_dirs(&self, t: &Trail<'_>, txn_id: &str, path: &str, target: &Id, source: &Id, ancestor: &Id) -> Result<()> {
        let a_entries = self.entries_of(t, ancestor)?;
        let s_entries = self.entries_of(t, source)?;
        let mut t_entries = self.entries_of(t, target)?;
        let mut changed = false;

        for (name, a_id) in &a_entries {
            let s_id = s_entries.get(name);
            if s_id == Some(a_id) {
                continue;
            }
            let t_id = t_entries.get(name).cloned();
            if t_id.as_ref() == Some(a_id) {
                match s_id {
                    Some(s) => t_entries.insert(name.clone(), s.clone()),
                    None => t_entries.remove(name),
                };
                changed = true;
                continue;
            }
            let child_path = join_path(path, name);
            match (s_id, t_id) {
                // Deleted on both sides.
                (None, None) => {}
                (Some(s), Some(tt)) => {
                    let (s_node, a_node, t_node) =
                        (self.open_node(t, s)?, self.open_node(t, a_id)?, self.open_node(t, &tt)?);
                    let mergeable = s_node.is_dir()
                        && a_node.is_dir()
                        && t_node.is_dir()
                        && t_node.is_mutable_in(txn_id)
                        && s.same_node(a_id)
                        && tt.same_node(a_id);
                    if !mergeable {
                        return Err(FsError::Conflict(child_path));
                    }
                    self.merge_dirs(t, txn_id, &child_path, &tt, s, a_id)?;
                }
                _ => return Err(FsError::Conflict(child_path)),
            }
        }

        for (name, s_id) in &s_entries {
            if a_entries.contains_key(name) {
                continue;
            }
            match t_entries.get(name) {
                Some(tt) if tt == s_id => {}
                Some(_) => return Err(FsError::Conflict(join_path(path, name))),
                None => {
                    t_entries.insert(name.clone(), s_id.clone());
                    changed = true;
                }
            }
        }

        if changed {
            self.write_entries(t, txn_id, target, &t_entries)?;
        }
        let mut noderev = node::get_node_revision(t, self.fs_path(), target)?;
        let a_rev = node::get_node_revision(t, self.fs_path(), ancestor)?;
        let s_rev = node::get_node_revision(t, self.fs_path(), source)?;
        if s_rev.prop_key != a_rev.prop_key && noderev.prop_key != s_rev.prop_key {
            if noderev.prop_key == a_rev.prop_key {
                noderev.prop_key = s_rev.prop_key.clone();
            } else if self.read_props(t, &noderev)? != self.read_props(t, &s_rev)? {
                return Err(FsError::Conflict(path.to_string()));
            }
        }
        noderev.predecessor = Some(source.clone());
        node::put_node_revision(t, target, &noderev)?;
        debug!("merged {} into {} at {}", source, target, path);
        Ok(())
    }

    /// Freeze every node mutable in the transaction below `id`
    fn freeze_tree(&self, t: &Trail<'_>, txn_id: &str, id: &Id, rev: Revnum, frozen: &mut Vec<NodeRevision>) -> Result<()> {
        let mut noderev = node::get_node_revision(t, self.fs_path(), id)?;
        if noderev.mutable_txn.as_deref() != Some(txn_id) {
            return Ok(());
        }
        if noderev.kind == NodeKind::Dir {
            for child in self.read_entries(t, &noderev)?.values() {
                self.freeze_tree(t, txn_id, child, rev, frozen)?;
            }
        }
        for key in [&noderev.prop_key, &noderev.data_key].into_iter().flatten() {
            reps::freeze_rep(t, key)?;
        }
        noderev.mutable_txn = None;
        noderev.rev = Some(rev);
        node::put_node_revision(t, id, &noderev)?;
        frozen.push(noderev);
        Ok(())
    }

    /// Store a predecessor's representations as deltas against its
    /// successor's.
    fn deltify_predecessor(&self, t: &Trail<'_>, noderev: &NodeRevision) -> Result<()> {
        let Some(pred) = &noderev.predecessor else {
            return Ok(());
        };
        let pred_rev = node::get_node_revision(t, self.fs_path(), pred)?;
        let pairs = [
            (&pred_rev.data_key, &noderev.data_key),
            (&pred_rev.prop_key, &noderev.prop_key),
        ];
        for (old, new) in pairs {
            if let (Some(old), Some(new)) = (old, new) {
                // A merge may leave both revisions sharing one representation.
                if old == new {
                    continue;
                }
                reps::deltify(t, old, new, self.config().delta_window_size)?;
            }
        }
        Ok(())
    }

    fn commit_trail(&self, t: &Trail<'_>, txn_id: &str, access: &Access) -> Result<Revnum> {
        let now = Utc::now();
        let youngest = revs::youngest_rev(t, self.fs_path())?;
        let youngest_root = revs::get_revision(t, self.fs_path(), youngest)?.root_id;

        self.make_path_mutable(t, txn_id, "/")?;
        let mut txn = txn::get_txn(t, txn_id)?;
        if txn.base_root_id != youngest_root {
            self.merge_dirs(t, txn_id, "/", &txn.root_id, &youngest_root, &txn.base_root_id)?;
            txn.base_root_id = youngest_root;
            txn::put_txn(t, txn_id, &txn)?;
        }

        let folded = changes::fold_changes(&changes::txn_changes(t, txn_id)?);
        for (path, c) in &folded {
            let recurse = matches!(c.kind, ChangeKind::Delete | ChangeKind::Replace);
            locks::allow_locked_operation(t, path, recurse, access, now)?;
        }

        let new_rev = youngest + 1;
        let mut frozen = Vec::new();
        self.freeze_tree(t, txn_id, &txn.root_id, new_rev, &mut frozen)?;

        let mut props = txn.props.clone();
        props.insert(
            PROP_REVISION_DATE.into(),
            Bytes::from(records::format_date(&now).into_bytes()),
        );
        revs::put_revision(
            t,
            new_rev,
            &Revision {
                txn_id: txn_id.to_string(),
                root_id: txn.root_id.clone(),
                props,
            },
        )?;
        txn::delete_txn(t, txn_id)?;
        clones::delete_txn_clones(t, txn_id)?;
        self.sweep_copies(t)?;

        if self.config().deltify_on_commit {
            for noderev in &frozen {
                self.deltify_predecessor(t, noderev)?;
            }
        }
        Ok(new_rev)
    }
}

// ---- public API ----

impl Filesystem {
    // ---- reads ----

    pub fn check_path(&self, root: &Root, path: &str) -> Result<Option<NodeKind>> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| self.kind_at(t, root, &path))
    }

    pub fn node_id(&self, root: &Root, path: &str) -> Result<Id> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| Ok(self.require(t, root, &path)?.id().clone()))
    }

    /// Revision that last changed the node at `path`
    pub fn node_created_rev(&self, root: &Root, path: &str) -> Result<Option<Revnum>> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| Ok(self.require(t, root, &path)?.noderev(t, self.fs_path())?.rev))
    }

    pub fn node_created_path(&self, root: &Root, path: &str) -> Result<String> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| Ok(self.require(t, root, &path)?.noderev(t, self.fs_path())?.created_path))
    }

    pub fn stat(&self, root: &Root, path: &str) -> Result<Dirent> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let node = self.require(t, root, &path)?;
            self.dirent_of(t, &node)
        })
    }

    pub fn dir_entries(&self, root: &Root, path: &str) -> Result<Entries> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let node = self.require(t, root, &path)?;
            if !node.is_dir() {
                return Err(FsError::NotDirectory(path.clone()));
            }
            self.node_entries(t, &node)
        })
    }

    /// Directory entries with their dirents, in name order
    pub fn dir_list(&self, root: &Root, path: &str) -> Result<Vec<(String, Dirent)>> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let node = self.require(t, root, &path)?;
            if !node.is_dir() {
                return Err(FsError::NotDirectory(path.clone()));
            }
            self.node_entries(t, &node)?
                .into_iter()
                .map(|(name, id)| {
                    let child = self.open_node(t, &id)?;
                    Ok((name, self.dirent_of(t, &child)?))
                })
                .collect()
        })
    }

    pub fn file_contents(&self, root: &Root, path: &str) -> Result<Vec<u8>> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let node = self.require(t, root, &path)?;
            let noderev = node.noderev(t, self.fs_path())?;
            if noderev.kind != NodeKind::File {
                return Err(FsError::NotFile(path.clone()));
            }
            match &noderev.data_key {
                Some(key) => reps::read_rep(t, key),
                None => Ok(Vec::new()),
            }
        })
    }

    pub fn file_length(&self, root: &Root, path: &str) -> Result<u64> {
        let dirent = self.stat(root, path)?;
        if dirent.kind != NodeKind::File {
            return Err(FsError::NotFile(path.to_string()));
        }
        Ok(dirent.size)
    }

    pub fn file_md5(&self, root: &Root, path: &str) -> Result<[u8; 16]> {
        Ok(md5::compute(self.file_contents(root, path)?).0)
    }

    pub fn node_proplist(&self, root: &Root, path: &str) -> Result<PropList> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let node = self.require(t, root, &path)?;
            self.read_props(t, &node.noderev(t, self.fs_path())?)
        })
    }

    pub fn node_prop(&self, root: &Root, path: &str, name: &str) -> Result<Option<Bytes>> {
        Ok(self.node_proplist(root, path)?.remove(name))
    }

    /// Paths changed in a revision or transaction, one folded change each
    pub fn paths_changed(&self, root: &Root) -> Result<BTreeMap<String, Change>> {
        self.retry_txn(|t| {
            let txn_id = match root {
                Root::Revision(rev) => revs::get_revision(t, self.fs_path(), *rev)?.txn_id,
                Root::Txn(txn_id) => txn_id.clone(),
            };
            Ok(changes::fold_changes(&changes::txn_changes(t, &txn_id)?))
        })
    }

    // ---- transactions ----

    /// Start a transaction based on revision `base_rev`
    pub fn begin_txn(&self, base_rev: Revnum) -> Result<String> {
        let date = records::format_date(&Utc::now());
        let txn_id = self.retry_txn(|t| {
            let root_id = revs::get_revision(t, self.fs_path(), base_rev)?.root_id;
            let mut props = PropList::new();
            props.insert(PROP_REVISION_DATE.into(), Bytes::copy_from_slice(date.as_bytes()));
            txn::create_txn(
                t,
                &Transaction {
                    root_id: root_id.clone(),
                    base_root_id: root_id,
                    props,
                },
            )
        })?;
        debug!("began transaction {} on r{}", txn_id, base_rev);
        Ok(txn_id)
    }

    pub fn list_txns(&self) -> Result<Vec<String>> {
        self.retry_txn(txn::list_txns)
    }

    pub fn txn_proplist(&self, txn_id: &str) -> Result<PropList> {
        self.retry_txn(|t| Ok(txn::get_txn(t, txn_id)?.props))
    }

    pub fn txn_prop(&self, txn_id: &str, name: &str) -> Result<Option<Bytes>> {
        Ok(self.txn_proplist(txn_id)?.remove(name))
    }

    pub fn change_txn_prop(&self, txn_id: &str, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.retry_txn(|t| {
            let mut txn = txn::get_txn(t, txn_id)?;
            match value {
                Some(v) => txn.props.insert(name.to_string(), Bytes::copy_from_slice(v)),
                None => txn.props.remove(name),
            };
            txn::put_txn(t, txn_id, &txn)
        })
    }

    /// Throw a transaction away along with every node it created
    pub fn abort_txn(&self, txn_id: &str) -> Result<()> {
        self.retry_txn(|t| {
            let txn = txn::get_txn(t, txn_id)?;
            self.delete_mutable_tree(t, txn_id, &txn.root_id)?;
            clones::delete_txn_clones(t, txn_id)?;
            changes::delete_changes(t, txn_id)?;
            txn::delete_txn(t, txn_id)?;
            self.sweep_copies(t)
        })?;
        info!("aborted transaction {}", txn_id);
        Ok(())
    }

    /// Commit a transaction as the next revision
    pub fn commit_txn(&self, txn_id: &str, access: &Access) -> Result<Revnum> {
        let rev = self.retry_txn(|t| self.commit_trail(t, txn_id, access))?;
        info!("committed transaction {} as r{}", txn_id, rev);
        Ok(rev)
    }

    // ---- mutations ----

    pub fn make_dir(&self, txn_id: &str, path: &str) -> Result<()> {
        self.make_node_at(txn_id, path, NodeKind::Dir)
    }

    pub fn make_file(&self, txn_id: &str, path: &str) -> Result<()> {
        self.make_node_at(txn_id, path, NodeKind::File)
    }

    fn make_node_at(&self, txn_id: &str, path: &str, kind: NodeKind) -> Result<()> {
        let path = canonicalize_path(path)?;
        if path == "/" {
            return Err(FsError::AlreadyExists(path));
        }
        self.retry_txn(|t| {
            let (parent, name) = split_path(&path);
            let parent_id = self.mutable_dir(t, txn_id, parent)?;
            let mut entries = self.entries_of(t, &parent_id)?;
            if entries.contains_key(name) {
                return Err(FsError::AlreadyExists(path.clone()));
            }
            clones::delete_subtree(t, txn_id, &path)?;
            let id = node::create_node(t, &NodeRevision::new(kind, &path, txn_id))?;
            entries.insert(name.to_string(), id.clone());
            self.write_entries(t, txn_id, &parent_id, &entries)?;
            changes::add_change(t, txn_id, &change(&path, &id, ChangeKind::Add, false, false))
        })
    }

    /// Remove `path` and everything below it
    pub fn delete(&self, txn_id: &str, path: &str) -> Result<()> {
        let path = canonicalize_path(path)?;
        if path == "/" {
            return Err(FsError::RootDir);
        }
        self.retry_txn(|t| {
            let (parent, name) = split_path(&path);
            let parent_id = self.mutable_dir(t, txn_id, parent)?;
            let mut entries = self.entries_of(t, &parent_id)?;
            let id = entries
                .remove(name)
                .ok_or_else(|| FsError::NotFound(path.clone()))?;
            self.write_entries(t, txn_id, &parent_id, &entries)?;
            self.delete_mutable_tree(t, txn_id, &id)?;
            clones::delete_subtree(t, txn_id, &path)?;
            changes::add_change(t, txn_id, &change(&path, &id, ChangeKind::Delete, false, false))
        })
    }

    pub fn set_file_contents(&self, txn_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let id = self.make_path_mutable(t, txn_id, &path)?;
            let mut noderev = node::get_node_revision(t, self.fs_path(), &id)?;
            if noderev.kind != NodeKind::File {
                return Err(FsError::NotFile(path.clone()));
            }
            noderev.data_key = Some(reps::set_rep_contents(t, noderev.data_key.as_deref(), data)?);
            node::put_node_revision(t, &id, &noderev)?;
            changes::add_change(t, txn_id, &change(&path, &id, ChangeKind::Modify, true, false))
        })
    }

    /// Set a node property, or delete it when `value` is `None`
    pub fn change_node_prop(&self, txn_id: &str, path: &str, name: &str, value: Option<&[u8]>) -> Result<()> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let id = self.make_path_mutable(t, txn_id, &path)?;
            let mut noderev = node::get_node_revision(t, self.fs_path(), &id)?;
            let mut props = self.read_props(t, &noderev)?;
            match value {
                Some(v) => props.insert(name.to_string(), Bytes::copy_from_slice(v)),
                None => props.remove(name),
            };
            let data = records::unparse_proplist(&props).unparse();
            noderev.prop_key = Some(reps::set_rep_contents(t, noderev.prop_key.as_deref(), &data)?);
            node::put_node_revision(t, &id, &noderev)?;
            changes::add_change(t, txn_id, &change(&path, &id, ChangeKind::Modify, false, true))
        })
    }

    /// Copy `src_path` from revision `src_rev` to `dst_path` in the transaction
    pub fn copy(&self, src_rev: Revnum, src_path: &str, txn_id: &str, dst_path: &str) -> Result<()> {
        let src_path = canonicalize_path(src_path)?;
        let dst_path = canonicalize_path(dst_path)?;
        if dst_path == "/" {
            return Err(FsError::RootDir);
        }
        self.retry_txn(|t| {
            let src = self.require(t, &Root::Revision(src_rev), &src_path)?;
            let (parent, name) = split_path(&dst_path);
            let parent_id = self.mutable_dir(t, txn_id, parent)?;
            let mut entries = self.entries_of(t, &parent_id)?;
            if entries.contains_key(name) {
                return Err(FsError::AlreadyExists(dst_path.clone()));
            }
            clones::delete_subtree(t, txn_id, &dst_path)?;

            let mut noderev = src.noderev(t, self.fs_path())?;
            noderev.mutable_txn = Some(txn_id.to_string());
            noderev.predecessor = Some(src.id().clone());
            noderev.rev = None;
            noderev.created_path = dst_path.clone();
            let new_id = node::create_successor(t, src.id(), &noderev)?;
            entries.insert(name.to_string(), new_id.clone());
            self.write_entries(t, txn_id, &parent_id, &entries)?;

            copies::add_copy(
                t,
                &Copy {
                    src_path: src_path.clone(),
                    src_rev,
                    dst_id: new_id.clone(),
                },
            )?;
            clones::set_cloned(t, txn_id, &dst_path, &new_id)?;
            changes::add_change(t, txn_id, &change(&dst_path, &new_id, ChangeKind::Add, false, false))
        })
    }

    /// Move the node at `from` to `to` within the transaction
    pub fn rename(&self, txn_id: &str, from: &str, to: &str) -> Result<()> {
        let from = canonicalize_path(from)?;
        let to = canonicalize_path(to)?;
        if from == "/" || to == "/" {
            return Err(FsError::RootDir);
        }
        if to == from || is_below(&to, &from) {
            return Err(FsError::PathSyntax(format!("cannot move '{}' into itself", from)));
        }
        self.retry_txn(|t| {
            let (to_parent, to_name) = split_path(&to);
            let to_parent_id = self.mutable_dir(t, txn_id, to_parent)?;
            let (from_parent, from_name) = split_path(&from);
            let from_parent_id = self.mutable_dir(t, txn_id, from_parent)?;

            let mut from_entries = self.entries_of(t, &from_parent_id)?;
            let id = from_entries
                .remove(from_name)
                .ok_or_else(|| FsError::NotFound(from.clone()))?;
            self.write_entries(t, txn_id, &from_parent_id, &from_entries)?;

            let mut to_entries = self.entries_of(t, &to_parent_id)?;
            if to_entries.contains_key(to_name) {
                return Err(FsError::AlreadyExists(to.clone()));
            }
            to_entries.insert(to_name.to_string(), id.clone());
            self.write_entries(t, txn_id, &to_parent_id, &to_entries)?;

            clones::delete_subtree(t, txn_id, &from)?;
            clones::delete_subtree(t, txn_id, &to)?;
            clones::set_moved(t, txn_id, &from, &to_parent_id, to_name)?;
            changes::add_change(t, txn_id, &change(&from, &id, ChangeKind::Delete, false, false))?;
            changes::add_change(t, txn_id, &change(&to, &id, ChangeKind::Add, false, false))
        })
    }

    /// Point `path` in the transaction at `src_path` as of `src_rev`, or
    /// remove it when the source does not exist. Records no change.
    pub fn link_path(&self, txn_id: &str, path: &str, src_rev: Revnum, src_path: &str) -> Result<()> {
        let path = canonicalize_path(path)?;
        let src_path = canonicalize_path(src_path)?;
        self.retry_txn(|t| {
            let src = self
                .lookup(t, &Root::Revision(src_rev), &src_path)?
                .map(|n| n.id().clone());
            if path == "/" {
                let src = src.ok_or_else(|| FsError::NotFound(src_path.clone()))?;
                let mut txn = txn::get_txn(t, txn_id)?;
                self.delete_mutable_tree(t, txn_id, &txn.root_id)?;
                txn.root_id = src;
                txn::put_txn(t, txn_id, &txn)?;
                return clones::delete_subtree(t, txn_id, "/");
            }
            let (parent, name) = split_path(&path);
            let parent_id = self.mutable_dir(t, txn_id, parent)?;
            let mut entries = self.entries_of(t, &parent_id)?;
            let old = match src {
                Some(id) => entries.insert(name.to_string(), id),
                None => entries.remove(name),
            };
            self.write_entries(t, txn_id, &parent_id, &entries)?;
            if let Some(old) = old {
                self.delete_mutable_tree(t, txn_id, &old)?;
            }
            clones::delete_subtree(t, txn_id, &path)
        })
    }

    /// Remove every entry of the directory at `path`. Records no change.
    pub fn clear_dir(&self, txn_id: &str, path: &str) -> Result<()> {
        let path = canonicalize_path(path)?;
        self.retry_txn(|t| {
            let id = self.mutable_dir(t, txn_id, &path)?;
            let entries = self.entries_of(t, &id)?;
            for (name, child) in &entries {
                self.delete_mutable_tree(t, txn_id, child)?;
                clones::delete_subtree(t, txn_id, &join_path(&path, name))?;
            }
            self.write_entries(t, txn_id, &id, &Entries::new())
        })
    }
}
