//! Filesystem handle
//!
//! A [`Filesystem`] owns the store, the node cache and the configuration of
//! one repository directory. Every public operation runs in its own trail.

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::id::Id;
use crate::kv::{Store, Table, Trail};
use crate::locks::{self, Access};
use crate::node::{Node, NodeCache};
use crate::records::{self, Lock, NodeKind, NodeRevision, PropList, Revision};
use crate::tree::{self, Root};
use crate::{PROP_REVISION_DATE, Revnum, revs};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Database file inside a repository directory
pub const DB_FILE: &str = "bsvn.db";

const UUID_KEY: &[u8] = b"uuid";

pub struct Filesystem {
    path: PathBuf,
    path_str: String,
    config: FsConfig,
    store: Store,
    cache: NodeCache,
    uuid: String,
}

impl Filesystem {
    /// Create a new filesystem in `path` with default configuration
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_config(path, FsConfig::default())
    }

    pub fn create_with_config(path: &Path, config: FsConfig) -> Result<Self> {
        fs::create_dir_all(path)?;
        let db_path = path.join(DB_FILE);
        if db_path.exists() {
            return Err(FsError::AlreadyExists(path.display().to_string()));
        }
        config.save(path)?;
        let store = Store::open(&db_path, true, &config)?;
        let fs = Self::init(path, config, store)?;
        info!("created filesystem {} at {}", fs.uuid, path.display());
        Ok(fs)
    }

    /// A throwaway filesystem living only in memory
    pub fn create_in_memory() -> Result<Self> {
        let config = FsConfig::default();
        let store = Store::open_in_memory(&config)?;
        Self::init(Path::new(":memory:"), config, store)
    }

    fn init(path: &Path, config: FsConfig, store: Store) -> Result<Self> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let date = records::format_date(&Utc::now());
        store.retry_txn(
            |t| {
                t.put(Table::Misc, UUID_KEY, uuid.as_bytes())?;
                let root = NodeRevision {
                    kind: NodeKind::Dir,
                    created_path: "/".into(),
                    mutable_txn: None,
                    predecessor: None,
                    rev: Some(0),
                    prop_key: None,
                    data_key: None,
                };
                crate::node::put_node_revision(t, &Id::root(), &root)?;
                let mut props = PropList::new();
                props.insert(PROP_REVISION_DATE.into(), Bytes::copy_from_slice(date.as_bytes()));
                revs::append_revision(
                    t,
                    &Revision {
                        txn_id: String::new(),
                        root_id: Id::root(),
                        props,
                    },
                )
            },
            &|| {},
        )?;
        Ok(Self {
            path: path.to_path_buf(),
            path_str: path.display().to_string(),
            config,
            store,
            cache: NodeCache::new(),
            uuid,
        })
    }

    /// Open an existing filesystem
    pub fn open(path: &Path) -> Result<Self> {
        let config = FsConfig::load(path)?;
        let store = Store::open(&path.join(DB_FILE), false, &config)?;
        let uuid = store.retry_txn(|t| t.get(Table::Misc, UUID_KEY), &|| {})?;
        let uuid = uuid
            .and_then(|u| String::from_utf8(u).ok())
            .ok_or_else(|| FsError::Database("filesystem has no UUID".into()))?;
        Ok(Self {
            path: path.to_path_buf(),
            path_str: path.display().to_string(),
            config,
            store,
            cache: NodeCache::new(),
            uuid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path used in error messages
    pub fn fs_path(&self) -> &str {
        &self.path_str
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Run `body` in a trail, retried on engine conflicts.
    ///
    /// The node cache is purged whenever a trail rolls back, since it may
    /// hold nodes that no longer exist.
    pub fn retry_txn<T>(&self, body: impl Fn(&Trail<'_>) -> Result<T>) -> Result<T> {
        self.store.retry_txn(body, &|| self.cache.purge())
    }

    pub(crate) fn open_node(&self, trail: &Trail<'_>, id: &Id) -> Result<Arc<Node>> {
        self.cache.open(trail, &self.path_str, id)
    }

    /// Number of nodes currently held open
    pub fn cached_node_count(&self) -> usize {
        self.cache.len()
    }

    // ---- revisions ----

    pub fn youngest_rev(&self) -> Result<Revnum> {
        self.retry_txn(|t| revs::youngest_rev(t, &self.path_str))
    }

    pub fn revision_root_id(&self, rev: Revnum) -> Result<Id> {
        self.retry_txn(|t| Ok(revs::get_revision(t, &self.path_str, rev)?.root_id))
    }

    pub fn revision_proplist(&self, rev: Revnum) -> Result<PropList> {
        self.retry_txn(|t| revs::rev_proplist(t, &self.path_str, rev))
    }

    pub fn revision_prop(&self, rev: Revnum, name: &str) -> Result<Option<Bytes>> {
        self.retry_txn(|t| revs::rev_prop(t, &self.path_str, rev, name))
    }

    /// Set or delete a revision property
    pub fn change_rev_prop(&self, rev: Revnum, name: &str, value: Option<&[u8]>) -> Result<()> {
        if name == PROP_REVISION_DATE {
            if let Some(v) = value {
                let text = std::str::from_utf8(v).map_err(|_| FsError::BadDate(String::from_utf8_lossy(v).into_owned()))?;
                records::parse_date(text)?;
            }
        }
        self.retry_txn(|t| revs::change_rev_prop(t, &self.path_str, rev, name, value))?;
        info!("changed revision property {} on r{}", name, rev);
        Ok(())
    }

    pub fn dated_revision(&self, when: DateTime<Utc>) -> Result<Revnum> {
        self.retry_txn(|t| revs::dated_revision(t, &self.path_str, when))
    }

    // ---- locks ----

    /// Lock the file at `path` in the youngest revision for `access`'s user
    pub fn lock(
        &self,
        path: &str,
        access: &Access,
        comment: Option<&str>,
        expires: Option<DateTime<Utc>>,
        steal: bool,
    ) -> Result<Lock> {
        let path = tree::canonicalize_path(path)?;
        let owner = access
            .username
            .clone()
            .ok_or_else(|| FsError::NoUser(path.clone()))?;
        let token = format!("opaquelocktoken:{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let lock = Lock {
            path: path.clone(),
            token,
            owner,
            comment: comment.map(str::to_string),
            dav_comment: false,
            created: now,
            expires,
        };
        self.retry_txn(|t| {
            let youngest = revs::youngest_rev(t, &self.path_str)?;
            match self.kind_at(t, &Root::Revision(youngest), &path)? {
                None => return Err(FsError::NotFound(path.clone())),
                Some(NodeKind::Dir) => return Err(FsError::NotFile(path.clone())),
                Some(NodeKind::File) => {}
            }
            if let Some(existing) = locks::get_lock(t, &path, now)? {
                if !steal {
                    return Err(FsError::PathAlreadyLocked {
                        path: path.clone(),
                        owner: existing.owner,
                    });
                }
            }
            locks::put_lock(t, &lock)
        })?;
        info!("locked {} for {}", lock.path, lock.owner);
        Ok(lock)
    }

    /// Remove the lock on `path`. Unless `break_lock`, the caller must own it
    /// and present its token.
    pub fn unlock(&self, path: &str, token: Option<&str>, access: &Access, break_lock: bool) -> Result<()> {
        let path = tree::canonicalize_path(path)?;
        let now = Utc::now();
        self.retry_txn(|t| {
            let lock = locks::get_lock(t, &path, now)?.ok_or_else(|| FsError::NoSuchLock(path.clone()))?;
            if !break_lock {
                if token != Some(lock.token.as_str()) {
                    return Err(FsError::BadLockToken { path: path.clone() });
                }
                let user = access.username.as_deref().ok_or_else(|| FsError::NoUser(path.clone()))?;
                if user != lock.owner {
                    return Err(FsError::LockOwnerMismatch {
                        user: user.to_string(),
                        path: path.clone(),
                        owner: lock.owner.clone(),
                    });
                }
            }
            locks::delete_lock(t, &path)
        })?;
        info!("unlocked {}", path);
        Ok(())
    }

    pub fn get_lock(&self, path: &str) -> Result<Option<Lock>> {
        let path = tree::canonicalize_path(path)?;
        let now = Utc::now();
        self.retry_txn(|t| locks::get_lock(t, &path, now))
    }

    /// Locks on `path` and below it
    pub fn get_locks(&self, path: &str) -> Result<Vec<Lock>> {
        let path = tree::canonicalize_path(path)?;
        let now = Utc::now();
        self.retry_txn(|t| locks::get_locks(t, &path, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let uuid = {
            let fs = Filesystem::create(&repo).unwrap();
            assert_eq!(fs.youngest_rev().unwrap(), 0);
            assert!(fs.revision_prop(0, PROP_REVISION_DATE).unwrap().is_some());
            fs.uuid().to_string()
        };
        let fs = Filesystem::open(&repo).unwrap();
        assert_eq!(fs.uuid(), uuid);
        assert_eq!(fs.revision_root_id(0).unwrap(), Id::root());
        assert!(matches!(Filesystem::create(&repo), Err(FsError::AlreadyExists(_))));
        assert!(Filesystem::open(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_change_rev_prop_validates_dates() {
        let fs = Filesystem::create_in_memory().unwrap();
        fs.change_rev_prop(0, "svn:log", Some(b"init")).unwrap();
        assert_eq!(fs.revision_prop(0, "svn:log").unwrap().as_deref(), Some(&b"init"[..]));
        assert!(matches!(
            fs.change_rev_prop(0, PROP_REVISION_DATE, Some(b"noon")),
            Err(FsError::BadDate(_))
        ));
        assert!(matches!(fs.revision_proplist(7), Err(FsError::NoSuchRevision(7))));
    }
}
