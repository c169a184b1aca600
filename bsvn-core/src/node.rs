//! Node revisions, ID allocation and the node cache
//!
//! Node revisions live in the `nodes` table keyed by [`Id::to_key`]. A node
//! revision is mutable while it carries a `mutable` flag naming its
//! transaction; commit clears the flag and stamps the revision, after which
//! the record never changes again. Editing a committed node means creating a
//! successor with [`create_successor`].

use crate::error::{FsError, Result};
use crate::id::Id;
use crate::kv::{Table, Trail};
use crate::records::{self, NodeKind, NodeRevision};
use crate::skel::Skel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Read and validate the node revision stored under `id`.
///
/// A missing record is a dangling reference and an unparsable one is
/// corruption; neither is ever reported as plain absence.
pub fn get_node_revision(trail: &Trail<'_>, fs_path: &str, id: &Id) -> Result<NodeRevision> {
    id.require_node_revision()?;
    let data = trail
        .get(Table::Nodes, &id.to_key())?
        .ok_or_else(|| FsError::DanglingId {
            id: id.to_string(),
            fs_path: fs_path.to_string(),
        })?;
    let corrupt = || FsError::CorruptNodeRevision {
        id: id.to_string(),
        fs_path: fs_path.to_string(),
    };
    let skel = Skel::parse(data).ok_or_else(corrupt)?;
    records::parse_node_revision(&skel).map_err(|_| corrupt())
}

/// Store a node revision. Only mutable node revisions may be rewritten.
pub fn put_node_revision(trail: &Trail<'_>, id: &Id, noderev: &NodeRevision) -> Result<()> {
    id.require_node_revision()?;
    trail.put(Table::Nodes, &id.to_key(), &records::unparse_node_revision(noderev).unparse())
}

pub fn delete_node_revision(trail: &Trail<'_>, id: &Id) -> Result<()> {
    id.require_node_revision()?;
    trail.delete(Table::Nodes, &id.to_key())?;
    Ok(())
}

/// Allocate the first revision ID of a brand-new node: one past the highest
/// node number in use.
pub fn new_node_id(trail: &Trail<'_>) -> Result<Id> {
    let mut cursor = trail.cursor(Table::Nodes);
    let next = match cursor.last()? {
        Some((key, _)) => {
            let last = Id::from_key(&key)
                .ok_or_else(|| FsError::Database("malformed key in nodes table".into()))?;
            last.node_number() + 1
        }
        None => 0,
    };
    Ok(Id::new(vec![next, 1]))
}

/// Allocate the ID for the next revision of `id`.
///
/// `n.v` is followed by `n.(v+1)` when that is free. Otherwise the successor
/// starts a branch `n.v.b.1`, where `b` is one past the highest branch
/// already sprouted from `n.v`.
pub fn new_successor_id(trail: &Trail<'_>, id: &Id) -> Result<Id> {
    let next = id.next_in_line()?;
    if !trail.exists(Table::Nodes, &next.to_key())? {
        return Ok(next);
    }
    // Everything keyed between n.v and n.(v+1) is a branch off n.v, so the
    // record just before n.(v+1) carries the highest branch number.
    let mut cursor = trail.cursor(Table::Nodes);
    cursor.seek_range(&next.to_key())?;
    let branch = match cursor.prev()? {
        Some((key, _)) => {
            let prev = Id::from_key(&key)
                .ok_or_else(|| FsError::Database("malformed key in nodes table".into()))?;
            let c = prev.components();
            if c.len() > id.len() && c.starts_with(id.components()) {
                c[id.len()] + 1
            } else {
                1
            }
        }
        None => 1,
    };
    id.branch(branch)
}

fn require_mutable(id: &Id, noderev: &NodeRevision) -> Result<()> {
    if noderev.is_mutable() {
        Ok(())
    } else {
        Err(FsError::NotMutable(id.to_string()))
    }
}

/// Store `noderev` as the first revision of a new node
pub fn create_node(trail: &Trail<'_>, noderev: &NodeRevision) -> Result<Id> {
    let id = new_node_id(trail)?;
    require_mutable(&id, noderev)?;
    put_node_revision(trail, &id, noderev)?;
    debug!("created node {}", id);
    Ok(id)
}

/// Store `noderev` as the successor of the committed node revision `old_id`
pub fn create_successor(trail: &Trail<'_>, old_id: &Id, noderev: &NodeRevision) -> Result<Id> {
    let id = new_successor_id(trail, old_id)?;
    require_mutable(&id, noderev)?;
    // Never hand out an ID that is already live.
    if trail.exists(Table::Nodes, &id.to_key())? {
        return Err(FsError::Database(format!("successor ID {} already in use", id)));
    }
    put_node_revision(trail, &id, noderev)?;
    debug!("created successor {} of {}", id, old_id);
    Ok(id)
}

/// An open node.
///
/// Committed nodes keep their parsed node revision for their whole lifetime;
/// mutable nodes re-read it on every access since it may change underneath.
#[derive(Debug)]
pub struct Node {
    id: Id,
    kind: NodeKind,
    mutable_txn: Option<String>,
    frozen: Option<NodeRevision>,
}

impl Node {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    /// Owning transaction, for mutable nodes
    pub fn mutable_txn(&self) -> Option<&str> {
        self.mutable_txn.as_deref()
    }

    pub fn is_mutable_in(&self, txn_id: &str) -> bool {
        self.mutable_txn.as_deref() == Some(txn_id)
    }

    /// Current node revision record
    pub fn noderev(&self, trail: &Trail<'_>, fs_path: &str) -> Result<NodeRevision> {
        match &self.frozen {
            Some(noderev) => Ok(noderev.clone()),
            None => get_node_revision(trail, fs_path, &self.id),
        }
    }
}

/// Open nodes of one filesystem handle.
///
/// The cache only holds weak references: a node stays cached exactly as long
/// as some caller holds the `Arc` returned by [`NodeCache::open`].
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: Mutex<HashMap<Vec<u8>, Weak<Node>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the node `id`, sharing an already-open instance when there is one
    pub fn open(&self, trail: &Trail<'_>, fs_path: &str, id: &Id) -> Result<Arc<Node>> {
        let key = id.to_key();
        {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(node) = nodes.get(&key).and_then(Weak::upgrade) {
                return Ok(node);
            }
        }
        let noderev = get_node_revision(trail, fs_path, id)?;
        let node = Arc::new(Node {
            id: id.clone(),
            kind: noderev.kind,
            mutable_txn: noderev.mutable_txn.clone(),
            frozen: if noderev.is_mutable() { None } else { Some(noderev) },
        });
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.retain(|_, weak| weak.strong_count() > 0);
        nodes.insert(key, Arc::downgrade(&node));
        Ok(node)
    }

    /// Forget every cached node; used when a trail rolls back
    pub fn purge(&self) {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of nodes currently open
    pub fn len(&self) -> usize {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::kv::Store;

    fn id(s: &str) -> Id {
        Id::parse(s.as_bytes()).unwrap()
    }

    fn store_with(ids: &[&str]) -> Store {
        let store = Store::open_in_memory(&FsConfig::default()).unwrap();
        store
            .retry_txn(
                |t| {
                    for s in ids {
                        let mut nr = NodeRevision::new(NodeKind::File, "/f", "1");
                        nr.mutable_txn = None;
                        put_node_revision(t, &id(s), &nr)?;
                    }
                    Ok(())
                },
                &|| {},
            )
            .unwrap();
        store
    }

    fn successor(store: &Store, of: &str) -> Id {
        store.retry_txn(|t| new_successor_id(t, &id(of)), &|| {}).unwrap()
    }

    #[test]
    fn test_successor_in_line_when_free() {
        let store = store_with(&["1.1", "1.2"]);
        assert_eq!(successor(&store, "1.2"), id("1.3"));
    }

    #[test]
    fn test_successor_branches_when_taken() {
        let store = store_with(&["1.1", "1.2"]);
        assert_eq!(successor(&store, "1.1"), id("1.1.1.1"));

        let store = store_with(&["1.1", "1.1.1.1", "1.1.1.2", "1.1.2.1", "1.1.2.1.1.1", "1.2"]);
        assert_eq!(successor(&store, "1.1"), id("1.1.3.1"));

        // branches off a different revision do not count
        let store = store_with(&["1.1", "1.2", "1.2.5.1", "1.3"]);
        assert_eq!(successor(&store, "1.2"), id("1.2.6.1"));
        assert_eq!(successor(&store, "1.1"), id("1.1.1.1"));
    }

    #[test]
    fn test_successor_rejects_node_ids() {
        let store = store_with(&["1.1"]);
        let err = store.retry_txn(|t| new_successor_id(t, &id("1.1.1")), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::NotNodeRevisionId(_)));
    }

    #[test]
    fn test_new_node_id_follows_highest_node() {
        let store = store_with(&[]);
        assert_eq!(store.retry_txn(new_node_id, &|| {}).unwrap(), id("0.1"));
        let store = store_with(&["0.0", "3.1", "3.1.1.1", "2.7"]);
        assert_eq!(store.retry_txn(new_node_id, &|| {}).unwrap(), id("4.1"));
    }

    #[test]
    fn test_create_requires_mutable() {
        let store = store_with(&["1.1"]);
        let mut frozen = NodeRevision::new(NodeKind::Dir, "/d", "1");
        frozen.mutable_txn = None;
        let err = store.retry_txn(|t| create_successor(t, &id("1.1"), &frozen), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::NotMutable(_)));
        let err = store.retry_txn(|t| create_node(t, &frozen), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::NotMutable(_)));
    }

    #[test]
    fn test_corrupt_and_dangling_are_distinct() {
        let store = store_with(&[]);
        store
            .retry_txn(|t| t.put(Table::Nodes, &id("5.1").to_key(), b"((link 1 /) 0  0 )"), &|| {})
            .unwrap();
        let err = store.retry_txn(|t| get_node_revision(t, "/repo", &id("5.1")), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::CorruptNodeRevision { .. }));
        assert!(err.to_string().contains("/repo"));

        let err = store.retry_txn(|t| get_node_revision(t, "/repo", &id("6.1")), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::DanglingId { .. }));
    }

    #[test]
    fn test_cache_shares_and_evicts() {
        let store = store_with(&["1.1"]);
        let cache = NodeCache::new();
        store
            .retry_txn(
                |t| {
                    let a = cache.open(t, "/repo", &id("1.1"))?;
                    let b = cache.open(t, "/repo", &id("1.1"))?;
                    assert!(Arc::ptr_eq(&a, &b));
                    assert_eq!(cache.len(), 1);
                    assert!(a.mutable_txn().is_none());
                    drop(a);
                    assert_eq!(cache.len(), 1);
                    drop(b);
                    assert_eq!(cache.len(), 0);
                    Ok(())
                },
                &|| {},
            )
            .unwrap();
    }
}
