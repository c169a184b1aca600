//! Typed records stored as skels
//!
//! Each record kind has a `parse_*` function that validates the skel's shape
//! before reading any field, and an `unparse_*` function producing the
//! canonical skel. Shape mismatches fail with [`FsError::MalformedSkel`]
//! naming the record kind; nothing is coerced.

use crate::error::{FsError, Result};
use crate::id::Id;
use crate::skel::Skel;
use crate::Revnum;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Property name to value. Later duplicates win when parsing.
pub type PropList = BTreeMap<String, Bytes>;

/// Directory entry name to node-revision ID
pub type Entries = BTreeMap<String, Id>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub txn_id: String,
    pub root_id: Id,
    pub props: PropList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub root_id: Id,
    pub base_root_id: Id,
    pub props: PropList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn from_atom(atom: &[u8]) -> Option<Self> {
        match atom {
            b"file" => Some(NodeKind::File),
            b"dir" => Some(NodeKind::Dir),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub kind: NodeKind,
    pub created_path: String,
    /// Owning transaction while the node is mutable
    pub mutable_txn: Option<String>,
    pub predecessor: Option<Id>,
    /// Revision that committed this node; `None` while mutable
    pub rev: Option<Revnum>,
    pub prop_key: Option<String>,
    pub data_key: Option<String>,
}

impl NodeRevision {
    pub fn new(kind: NodeKind, created_path: &str, txn_id: &str) -> Self {
        Self {
            kind,
            created_path: created_path.to_string(),
            mutable_txn: Some(txn_id.to_string()),
            predecessor: None,
            rev: None,
            prop_key: None,
            data_key: None,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable_txn.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaChunk {
    /// Offset of this window's output in the reconstructed text
    pub offset: u64,
    /// Representation the window's source view reads from
    pub base_rep_key: Option<String>,
    /// String holding the svndiff bytes of the window
    pub diff_key: String,
    /// Length of the text this window produces
    pub size: u64,
    pub md5: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepBody {
    Fulltext(Option<String>),
    Delta(Vec<DeltaChunk>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub mutable: bool,
    pub body: RepBody,
}

impl Representation {
    pub fn fulltext(string_key: Option<String>, mutable: bool) -> Self {
        Self {
            mutable,
            body: RepBody::Fulltext(string_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Copy {
    pub src_path: String,
    pub src_rev: Revnum,
    pub dst_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Replace => "replace",
            ChangeKind::Modify => "modify",
        }
    }

    /// Single-letter action used by `log` output
    pub fn action(&self) -> &'static str {
        match self {
            ChangeKind::Add => "A",
            ChangeKind::Delete => "D",
            ChangeKind::Replace => "R",
            ChangeKind::Modify => "M",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub id: Option<Id>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneInfo {
    Cloned(Id),
    Moved { parent: Id, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub dav_comment: bool,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }
}

/// Format a timestamp the way records and `svn:date` store it
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| FsError::BadDate(text.to_string()))
}

// ---- field helpers ----

fn list_of<'a>(skel: &'a Skel, kind: &'static str) -> Result<&'a [Skel]> {
    skel.children().ok_or(FsError::malformed(kind))
}

fn atom_of<'a>(skel: &'a Skel, kind: &'static str) -> Result<&'a Bytes> {
    skel.as_atom().ok_or(FsError::malformed(kind))
}

fn string_of(skel: &Skel, kind: &'static str) -> Result<String> {
    let atom = atom_of(skel, kind)?;
    String::from_utf8(atom.to_vec()).map_err(|_| FsError::malformed(kind))
}

fn opt_string_of(skel: &Skel, kind: &'static str) -> Result<Option<String>> {
    let s = string_of(skel, kind)?;
    Ok(if s.is_empty() { None } else { Some(s) })
}

fn number_of(skel: &Skel, kind: &'static str) -> Result<u64> {
    skel.as_u64().ok_or(FsError::malformed(kind))
}

fn id_of(skel: &Skel, kind: &'static str) -> Result<Id> {
    Id::parse(atom_of(skel, kind)?).ok_or(FsError::malformed(kind))
}

fn opt_id_of(skel: &Skel, kind: &'static str) -> Result<Option<Id>> {
    let atom = atom_of(skel, kind)?;
    if atom.is_empty() {
        return Ok(None);
    }
    Id::parse(atom).map(Some).ok_or(FsError::malformed(kind))
}

fn bool_of(skel: &Skel, kind: &'static str) -> Result<bool> {
    let atom = atom_of(skel, kind)?;
    match atom.as_ref() {
        b"" => Ok(false),
        b"1" => Ok(true),
        _ => Err(FsError::malformed(kind)),
    }
}

fn bool_atom(b: bool) -> Skel {
    if b { Skel::str_atom("1") } else { Skel::empty_atom() }
}

fn opt_atom(value: Option<&str>) -> Skel {
    value.map_or_else(Skel::empty_atom, Skel::str_atom)
}

fn id_atom(id: &Id) -> Skel {
    Skel::str_atom(&id.to_string())
}

fn opt_id_atom(id: Option<&Id>) -> Skel {
    id.map_or_else(Skel::empty_atom, id_atom)
}

fn date_of(skel: &Skel, kind: &'static str) -> Result<Option<DateTime<Utc>>> {
    match opt_string_of(skel, kind)? {
        None => Ok(None),
        Some(text) => parse_date(&text).map(Some).map_err(|_| FsError::malformed(kind)),
    }
}

fn date_atom(date: Option<&DateTime<Utc>>) -> Skel {
    date.map_or_else(Skel::empty_atom, |d| Skel::str_atom(&format_date(d)))
}

// ---- proplist ----

pub fn parse_proplist(skel: &Skel) -> Result<PropList> {
    let items = list_of(skel, "proplist")?;
    if items.len() % 2 != 0 || !items.iter().all(Skel::is_atom) {
        return Err(FsError::malformed("proplist"));
    }
    let mut props = PropList::new();
    for pair in items.chunks_exact(2) {
        let name = string_of(&pair[0], "proplist")?;
        props.insert(name, atom_of(&pair[1], "proplist")?.clone());
    }
    Ok(props)
}

pub fn unparse_proplist(props: &PropList) -> Skel {
    let mut items = Vec::with_capacity(props.len() * 2);
    for (name, value) in props {
        items.push(Skel::str_atom(name));
        items.push(Skel::atom(value.clone()));
    }
    Skel::list(items)
}

// ---- revision ----

pub fn parse_revision(skel: &Skel) -> Result<Revision> {
    const KIND: &str = "revision";
    let items = list_of(skel, KIND)?;
    if items.len() != 4 || !items[0].matches_atom("revision") || !items[3].is_list() {
        return Err(FsError::malformed(KIND));
    }
    Ok(Revision {
        txn_id: string_of(&items[1], KIND)?,
        root_id: id_of(&items[2], KIND)?,
        props: parse_proplist(&items[3]).map_err(|_| FsError::malformed(KIND))?,
    })
}

pub fn unparse_revision(rev: &Revision) -> Skel {
    Skel::list(vec![
        Skel::str_atom("revision"),
        Skel::str_atom(&rev.txn_id),
        id_atom(&rev.root_id),
        unparse_proplist(&rev.props),
    ])
}

// ---- transaction ----

pub fn parse_transaction(skel: &Skel) -> Result<Transaction> {
    const KIND: &str = "transaction";
    let items = list_of(skel, KIND)?;
    if items.len() != 4 || !items[0].matches_atom("transaction") || !items[3].is_list() {
        return Err(FsError::malformed(KIND));
    }
    Ok(Transaction {
        root_id: id_of(&items[1], KIND)?,
        base_root_id: id_of(&items[2], KIND)?,
        props: parse_proplist(&items[3]).map_err(|_| FsError::malformed(KIND))?,
    })
}

pub fn unparse_transaction(txn: &Transaction) -> Skel {
    Skel::list(vec![
        Skel::str_atom("transaction"),
        id_atom(&txn.root_id),
        id_atom(&txn.base_root_id),
        unparse_proplist(&txn.props),
    ])
}

// ---- node revision ----

pub fn parse_node_revision(skel: &Skel) -> Result<NodeRevision> {
    const KIND: &str = "node-revision";
    let items = list_of(skel, KIND)?;
    if items.len() != 3 || !items[1].is_atom() || !items[2].is_atom() {
        return Err(FsError::malformed(KIND));
    }
    let header = list_of(&items[0], KIND)?;
    if header.len() < 2 {
        return Err(FsError::malformed(KIND));
    }
    let kind = NodeKind::from_atom(atom_of(&header[0], KIND)?).ok_or(FsError::malformed(KIND))?;
    let mut node = NodeRevision {
        kind,
        created_path: string_of(&header[1], KIND)?,
        mutable_txn: None,
        predecessor: None,
        rev: None,
        prop_key: opt_string_of(&items[1], KIND)?,
        data_key: opt_string_of(&items[2], KIND)?,
    };
    for flag in &header[2..] {
        let parts = list_of(flag, KIND)?;
        if parts.len() != 2 {
            return Err(FsError::malformed(KIND));
        }
        let name = atom_of(&parts[0], KIND)?;
        match name.as_ref() {
            b"mutable" => node.mutable_txn = Some(string_of(&parts[1], KIND)?),
            b"predecessor" => node.predecessor = Some(id_of(&parts[1], KIND)?),
            b"rev" => node.rev = Some(number_of(&parts[1], KIND)?),
            _ => return Err(FsError::malformed(KIND)),
        }
    }
    Ok(node)
}

pub fn unparse_node_revision(node: &NodeRevision) -> Skel {
    let mut header = vec![
        Skel::str_atom(node.kind.as_str()),
        Skel::str_atom(&node.created_path),
    ];
    if let Some(txn) = &node.mutable_txn {
        header.push(Skel::list(vec![Skel::str_atom("mutable"), Skel::str_atom(txn)]));
    }
    if let Some(pred) = &node.predecessor {
        header.push(Skel::list(vec![Skel::str_atom("predecessor"), id_atom(pred)]));
    }
    if let Some(rev) = node.rev {
        header.push(Skel::list(vec![Skel::str_atom("rev"), Skel::num_atom(rev)]));
    }
    Skel::list(vec![
        Skel::list(header),
        opt_atom(node.prop_key.as_deref()),
        opt_atom(node.data_key.as_deref()),
    ])
}

// ---- representation ----

fn parse_chunk(skel: &Skel) -> Result<DeltaChunk> {
    const KIND: &str = "representation";
    let items = list_of(skel, KIND)?;
    if items.len() != 2 {
        return Err(FsError::malformed(KIND));
    }
    let offset = number_of(&items[0], KIND)?;
    let window = list_of(&items[1], KIND)?;
    if window.len() != 4 {
        return Err(FsError::malformed(KIND));
    }
    let diff = list_of(&window[1], KIND)?;
    if diff.len() != 2 || !diff[0].matches_atom("svndiff") {
        return Err(FsError::malformed(KIND));
    }
    let checksum = list_of(&window[3], KIND)?;
    if checksum.len() != 2 || !checksum[0].matches_atom("md5") {
        return Err(FsError::malformed(KIND));
    }
    let digest = atom_of(&checksum[1], KIND)?;
    let md5: [u8; 16] = digest.as_ref().try_into().map_err(|_| FsError::malformed(KIND))?;
    Ok(DeltaChunk {
        offset,
        base_rep_key: opt_string_of(&window[0], KIND)?,
        diff_key: string_of(&diff[1], KIND)?,
        size: number_of(&window[2], KIND)?,
        md5,
    })
}

pub fn parse_representation(skel: &Skel) -> Result<Representation> {
    const KIND: &str = "representation";
    let items = list_of(skel, KIND)?;
    let header = items.first().and_then(Skel::children).ok_or(FsError::malformed(KIND))?;
    let mutable = match header.len() {
        1 => false,
        2 if header[1].matches_atom("mutable") => true,
        _ => return Err(FsError::malformed(KIND)),
    };
    if header[0].matches_atom("fulltext") {
        if items.len() != 2 {
            return Err(FsError::malformed(KIND));
        }
        return Ok(Representation {
            mutable,
            body: RepBody::Fulltext(opt_string_of(&items[1], KIND)?),
        });
    }
    if header[0].matches_atom("delta") {
        let chunks = items[1..].iter().map(parse_chunk).collect::<Result<Vec<_>>>()?;
        if chunks.windows(2).any(|w| w[0].offset >= w[1].offset) {
            return Err(FsError::malformed(KIND));
        }
        return Ok(Representation {
            mutable,
            body: RepBody::Delta(chunks),
        });
    }
    Err(FsError::malformed(KIND))
}

pub fn unparse_representation(rep: &Representation) -> Skel {
    let header = |kind: &str| {
        let mut h = vec![Skel::str_atom(kind)];
        if rep.mutable {
            h.push(Skel::str_atom("mutable"));
        }
        Skel::list(h)
    };
    match &rep.body {
        RepBody::Fulltext(key) => Skel::list(vec![header("fulltext"), opt_atom(key.as_deref())]),
        RepBody::Delta(chunks) => {
            let mut items = vec![header("delta")];
            for c in chunks {
                items.push(Skel::list(vec![
                    Skel::num_atom(c.offset),
                    Skel::list(vec![
                        opt_atom(c.base_rep_key.as_deref()),
                        Skel::list(vec![Skel::str_atom("svndiff"), Skel::str_atom(&c.diff_key)]),
                        Skel::num_atom(c.size),
                        Skel::list(vec![
                            Skel::str_atom("md5"),
                            Skel::atom(Bytes::copy_from_slice(&c.md5)),
                        ]),
                    ]),
                ]));
            }
            Skel::list(items)
        }
    }
}

// ---- directory entries ----

pub fn parse_entries(skel: &Skel) -> Result<Entries> {
    const KIND: &str = "entries";
    let items = list_of(skel, KIND)?;
    let mut entries = Entries::new();
    for item in items {
        let pair = list_of(item, KIND)?;
        if pair.len() != 2 {
            return Err(FsError::malformed(KIND));
        }
        entries.insert(string_of(&pair[0], KIND)?, id_of(&pair[1], KIND)?);
    }
    Ok(entries)
}

pub fn unparse_entries(entries: &Entries) -> Skel {
    Skel::list(
        entries
            .iter()
            .map(|(name, id)| Skel::list(vec![Skel::str_atom(name), id_atom(id)]))
            .collect(),
    )
}

// ---- copy ----

pub fn parse_copy(skel: &Skel) -> Result<Copy> {
    const KIND: &str = "copy";
    let items = list_of(skel, KIND)?;
    if items.len() != 4 || !items[0].matches_atom("copy") {
        return Err(FsError::malformed(KIND));
    }
    Ok(Copy {
        src_path: string_of(&items[1], KIND)?,
        src_rev: number_of(&items[2], KIND)?,
        dst_id: id_of(&items[3], KIND)?,
    })
}

pub fn unparse_copy(copy: &Copy) -> Skel {
    Skel::list(vec![
        Skel::str_atom("copy"),
        Skel::str_atom(&copy.src_path),
        Skel::num_atom(copy.src_rev),
        id_atom(&copy.dst_id),
    ])
}

// ---- change ----

pub fn parse_change(skel: &Skel) -> Result<Change> {
    const KIND: &str = "change";
    let items = list_of(skel, KIND)?;
    if items.len() != 6 || !items[0].matches_atom("change") {
        return Err(FsError::malformed(KIND));
    }
    let kind = match atom_of(&items[3], KIND)?.as_ref() {
        b"add" => ChangeKind::Add,
        b"delete" => ChangeKind::Delete,
        b"replace" => ChangeKind::Replace,
        b"modify" => ChangeKind::Modify,
        _ => return Err(FsError::malformed(KIND)),
    };
    Ok(Change {
        path: string_of(&items[1], KIND)?,
        id: opt_id_of(&items[2], KIND)?,
        kind,
        text_mod: bool_of(&items[4], KIND)?,
        prop_mod: bool_of(&items[5], KIND)?,
    })
}

pub fn unparse_change(change: &Change) -> Skel {
    Skel::list(vec![
        Skel::str_atom("change"),
        Skel::str_atom(&change.path),
        opt_id_atom(change.id.as_ref()),
        Skel::str_atom(change.kind.as_str()),
        bool_atom(change.text_mod),
        bool_atom(change.prop_mod),
    ])
}

// ---- clone ----

pub fn parse_clone(skel: &Skel) -> Result<CloneInfo> {
    const KIND: &str = "clone";
    let items = list_of(skel, KIND)?;
    match items {
        [tag, id] if tag.matches_atom("cloned") => Ok(CloneInfo::Cloned(id_of(id, KIND)?)),
        [tag, parent, name] if tag.matches_atom("moved") => Ok(CloneInfo::Moved {
            parent: id_of(parent, KIND)?,
            name: string_of(name, KIND)?,
        }),
        _ => Err(FsError::malformed(KIND)),
    }
}

pub fn unparse_clone(info: &CloneInfo) -> Skel {
    match info {
        CloneInfo::Cloned(id) => Skel::list(vec![Skel::str_atom("cloned"), id_atom(id)]),
        CloneInfo::Moved { parent, name } => Skel::list(vec![
            Skel::str_atom("moved"),
            id_atom(parent),
            Skel::str_atom(name),
        ]),
    }
}

// ---- lock ----

pub fn parse_lock(skel: &Skel) -> Result<Lock> {
    const KIND: &str = "lock";
    let items = list_of(skel, KIND)?;
    if items.len() != 8 || !items[0].matches_atom("lock") {
        return Err(FsError::malformed(KIND));
    }
    Ok(Lock {
        path: string_of(&items[1], KIND)?,
        token: string_of(&items[2], KIND)?,
        owner: string_of(&items[3], KIND)?,
        comment: opt_string_of(&items[4], KIND)?,
        dav_comment: bool_of(&items[5], KIND)?,
        created: date_of(&items[6], KIND)?.ok_or(FsError::malformed(KIND))?,
        expires: date_of(&items[7], KIND)?,
    })
}

pub fn unparse_lock(lock: &Lock) -> Skel {
    Skel::list(vec![
        Skel::str_atom("lock"),
        Skel::str_atom(&lock.path),
        Skel::str_atom(&lock.token),
        Skel::str_atom(&lock.owner),
        opt_atom(lock.comment.as_deref()),
        bool_atom(lock.dav_comment),
        date_atom(Some(&lock.created)),
        date_atom(lock.expires.as_ref()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skel(text: &str) -> Skel {
        Skel::parse(text.as_bytes().to_vec()).unwrap()
    }

    fn id(s: &str) -> Id {
        Id::parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_proplist_last_wins_and_rejects_odd() {
        let props = parse_proplist(&skel("(a 1 x b 1 y a 1 z)")).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props["a"].as_ref(), b"z");
        assert!(parse_proplist(&skel("(a)")).is_err());
        assert!(parse_proplist(&skel("(a (b))")).is_err());
        assert!(parse_proplist(&skel("foo")).is_err());
    }

    #[test]
    fn test_revision_round_trip_and_shape() {
        let mut props = PropList::new();
        props.insert("svn:log".into(), Bytes::from_static(b"first commit"));
        let rev = Revision {
            txn_id: "3".into(),
            root_id: id("0.2"),
            props,
        };
        let parsed = parse_revision(&Skel::parse(unparse_revision(&rev).unparse()).unwrap()).unwrap();
        assert_eq!(parsed, rev);

        let err = parse_revision(&skel("(revision 1 1 3 0.0)")).unwrap_err();
        assert!(matches!(err, FsError::MalformedSkel { kind: "revision" }));
        assert!(parse_revision(&skel("(transaction 1 1 3 0.0 ())")).is_err());
        assert!(parse_revision(&skel("(revision 1 1 3 0.x ())")).is_err());
    }

    #[test]
    fn test_transaction_round_trip() {
        let txn = Transaction {
            root_id: id("0.1"),
            base_root_id: id("0.0"),
            props: PropList::new(),
        };
        assert_eq!(parse_transaction(&unparse_transaction(&txn)).unwrap(), txn);
        assert!(parse_transaction(&skel("(transaction 3 0.1 ())")).is_err());
    }

    #[test]
    fn test_node_revision_flags() {
        let text = "((file 5 /iota (mutable 1 2) (predecessor 3 3.1)) 1 4 2 a7)";
        let node = parse_node_revision(&skel(text)).unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.created_path, "/iota");
        assert_eq!(node.mutable_txn.as_deref(), Some("2"));
        assert_eq!(node.predecessor, Some(id("3.1")));
        assert_eq!(node.prop_key.as_deref(), Some("4"));
        assert_eq!(node.data_key.as_deref(), Some("a7"));
        assert_eq!(parse_node_revision(&unparse_node_revision(&node)).unwrap(), node);

        let frozen = NodeRevision {
            mutable_txn: None,
            rev: Some(9),
            prop_key: None,
            ..node
        };
        let back = parse_node_revision(&unparse_node_revision(&frozen)).unwrap();
        assert_eq!(back.rev, Some(9));
        assert_eq!(back.prop_key, None);
        assert!(!back.is_mutable());
    }

    #[test]
    fn test_node_revision_rejects_bad_kind_and_flags() {
        assert!(parse_node_revision(&skel("((link 1 /) 0  0 )")).is_err());
        assert!(parse_node_revision(&skel("((file 1 / (bogus 1 1)) 0  0 )")).is_err());
        assert!(parse_node_revision(&skel("((file) 0  0 )")).is_err());
        assert!(parse_node_revision(&skel("((dir 1 /) 0 )")).is_err());
    }

    #[test]
    fn test_representation_fulltext_round_trip() {
        let rep = Representation::fulltext(Some("2c".into()), true);
        let s = unparse_representation(&rep);
        assert_eq!(s.to_string(), "((fulltext mutable) 2 2c)");
        let back = parse_representation(&Skel::parse(s.unparse()).unwrap()).unwrap();
        assert_eq!(back, rep);

        let empty = parse_representation(&skel("((fulltext) 0 )")).unwrap();
        assert_eq!(empty.body, RepBody::Fulltext(None));
        assert!(!empty.mutable);
    }

    #[test]
    fn test_representation_delta_round_trip() {
        let chunks = vec![
            DeltaChunk {
                offset: 0,
                base_rep_key: Some("5".into()),
                diff_key: "a".into(),
                size: 102400,
                md5: [7u8; 16],
            },
            DeltaChunk {
                offset: 102400,
                base_rep_key: None,
                diff_key: "b".into(),
                size: 17,
                md5: *b"0123456789abcdef",
            },
        ];
        let rep = Representation {
            mutable: false,
            body: RepBody::Delta(chunks.clone()),
        };
        let back =
            parse_representation(&Skel::parse(unparse_representation(&rep).unparse()).unwrap()).unwrap();
        assert_eq!(back, rep);
        match back.body {
            RepBody::Delta(parsed) => {
                assert_eq!(parsed.len(), 2);
                assert_eq!(parsed[1].offset, 102400);
                assert_eq!(parsed[1].md5, chunks[1].md5);
            }
            RepBody::Fulltext(_) => panic!("expected delta"),
        }
    }

    #[test]
    fn test_representation_rejects_bad_shapes() {
        assert!(parse_representation(&skel("((fulltext frozen) 1 1)")).is_err());
        assert!(parse_representation(&skel("((stream) 1 1)")).is_err());
        assert!(parse_representation(&skel("((delta) (1 0 (1 1 (svndiff 1 2) 1 3 (md5 3 abc))))")).is_err());
        assert!(parse_representation(&skel("((delta) (1 0 (1 1 (gzip 1 2) 1 3 (md5 16 0123456789abcdef))))")).is_err());
        // offsets must increase
        let dup = "((delta) (1 5 (1 1 (svndiff 1 2) 1 3 (md5 16 0123456789abcdef))) \
                   (1 5 (1 1 (svndiff 1 3) 1 3 (md5 16 0123456789abcdef))))";
        assert!(parse_representation(&skel(dup)).is_err());
    }

    #[test]
    fn test_entries_copy_change() {
        let entries = parse_entries(&skel("((iota 3 2.1) (A 3 3.1))")).unwrap();
        assert_eq!(entries["iota"], id("2.1"));
        assert_eq!(parse_entries(&unparse_entries(&entries)).unwrap(), entries);
        assert!(parse_entries(&skel("((iota))")).is_err());

        let copy = Copy {
            src_path: "/trunk".into(),
            src_rev: 4,
            dst_id: id("5.1.1.1"),
        };
        assert_eq!(parse_copy(&unparse_copy(&copy)).unwrap(), copy);

        let change = Change {
            path: "/trunk/a".into(),
            id: None,
            kind: ChangeKind::Delete,
            text_mod: false,
            prop_mod: true,
        };
        assert_eq!(parse_change(&unparse_change(&change)).unwrap(), change);
        assert!(parse_change(&skel("(change 2 /a 3 1.1 move 1 1 1 1)")).is_err());
    }

    #[test]
    fn test_clone_and_lock() {
        let moved = CloneInfo::Moved {
            parent: id("1.2"),
            name: "b".into(),
        };
        assert_eq!(parse_clone(&unparse_clone(&moved)).unwrap(), moved);
        assert_eq!(
            parse_clone(&skel("(cloned 3 4.1)")).unwrap(),
            CloneInfo::Cloned(id("4.1"))
        );
        assert!(parse_clone(&skel("(cloned 3 4.1 x)")).is_err());

        let created = parse_date("2002-06-12T20:28:32.123456Z").unwrap();
        let lock = Lock {
            path: "/iota".into(),
            token: "opaquelocktoken:abc".into(),
            owner: "jrandom".into(),
            comment: Some("editing".into()),
            dav_comment: false,
            created,
            expires: None,
        };
        let back = parse_lock(&Skel::parse(unparse_lock(&lock).unparse()).unwrap()).unwrap();
        assert_eq!(back, lock);
        assert_eq!(format_date(&back.created), "2002-06-12T20:28:32.123456Z");
        assert!(!back.is_expired(Utc::now()));
    }
}
