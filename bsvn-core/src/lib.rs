//! BSvn Core Library
//!
//! The versioned filesystem behind the bsvn server:
//! - Skel codec and the typed records built on it
//! - Transactional key-value store (trails with retry) over SQLite
//! - Node revisions with copy-on-write successors and a node cache
//! - Representations (fulltext and svndiff deltas) and strings
//! - Revisions, transactions, clones, changes, copies and locks
//! - Tree operations: read, mutate, merge and commit

pub mod changes;
pub mod clones;
pub mod config;
pub mod copies;
pub mod error;
pub mod fs;
pub mod id;
pub mod key;
pub mod kv;
pub mod locks;
pub mod node;
pub mod records;
pub mod reps;
pub mod revs;
pub mod skel;
pub mod svndiff;
pub mod tree;
pub mod txn;

/// A revision number. Revision 0 is the empty tree created with the filesystem.
pub type Revnum = u64;

pub use config::FsConfig;
pub use error::{FsError, Result};
pub use fs::Filesystem;
pub use id::Id;
pub use locks::Access;
pub use records::{Change, ChangeKind, Entries, Lock, NodeKind, PropList};
pub use skel::Skel;
pub use svndiff::TxDeltaWindow;
pub use tree::{Dirent, Root};

/// Revision property holding the commit timestamp
pub const PROP_REVISION_DATE: &str = "svn:date";
/// Revision property holding the committer
pub const PROP_REVISION_AUTHOR: &str = "svn:author";
/// Revision property holding the log message
pub const PROP_REVISION_LOG: &str = "svn:log";
