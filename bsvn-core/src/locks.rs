//! Path locks
//!
//! Locks are keyed by path. An expired lock is treated as absent and is
//! removed the next time it is looked at.

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, Lock};
use crate::skel::Skel;
use chrono::{DateTime, Utc};

/// Who is acting on the filesystem, and which lock tokens they hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    pub username: Option<String>,
    pub lock_tokens: Vec<String>,
}

impl Access {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            lock_tokens: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, token: impl Into<String>) {
        self.lock_tokens.push(token.into());
    }
}

fn read_lock(trail: &Trail<'_>, key: &[u8]) -> Result<Option<Lock>> {
    let Some(data) = trail.get(Table::Locks, key)? else {
        return Ok(None);
    };
    let skel = Skel::parse(data).ok_or(FsError::malformed("lock"))?;
    records::parse_lock(&skel).map(Some)
}

/// The live lock on `path`, if any
pub fn get_lock(trail: &Trail<'_>, path: &str, now: DateTime<Utc>) -> Result<Option<Lock>> {
    match read_lock(trail, path.as_bytes())? {
        Some(lock) if lock.is_expired(now) => {
            trail.delete(Table::Locks, path.as_bytes())?;
            Ok(None)
        }
        other => Ok(other),
    }
}

/// Live locks on `path` and every path below it
pub fn get_locks(trail: &Trail<'_>, path: &str, now: DateTime<Utc>) -> Result<Vec<Lock>> {
    let mut locks = Vec::new();
    if let Some(lock) = get_lock(trail, path, now)? {
        locks.push(lock);
    }
    let below = if path == "/" { "/".to_string() } else { format!("{}/", path) };
    for (key, _) in trail.scan_prefix(Table::Locks, below.as_bytes())? {
        if key == path.as_bytes() {
            continue;
        }
        let text = String::from_utf8(key).map_err(|_| FsError::malformed("lock"))?;
        if let Some(lock) = get_lock(trail, &text, now)? {
            locks.push(lock);
        }
    }
    Ok(locks)
}

pub fn put_lock(trail: &Trail<'_>, lock: &Lock) -> Result<()> {
    trail.put(Table::Locks, lock.path.as_bytes(), &records::unparse_lock(lock).unparse())
}

pub fn delete_lock(trail: &Trail<'_>, path: &str) -> Result<()> {
    if !trail.delete(Table::Locks, path.as_bytes())? {
        return Err(FsError::NoSuchLock(path.to_string()));
    }
    Ok(())
}

/// Check that `access` may modify a path held by `lock`
pub fn verify_lock(lock: &Lock, access: &Access) -> Result<()> {
    let user = access
        .username
        .as_deref()
        .ok_or_else(|| FsError::NoUser(lock.path.clone()))?;
    if user != lock.owner {
        return Err(FsError::LockOwnerMismatch {
            user: user.to_string(),
            path: lock.path.clone(),
            owner: lock.owner.clone(),
        });
    }
    if !access.lock_tokens.iter().any(|t| *t == lock.token) {
        return Err(FsError::BadLockToken {
            path: lock.path.clone(),
        });
    }
    Ok(())
}

/// Check every live lock at `path` (and below it, when `recurse`)
pub fn allow_locked_operation(
    trail: &Trail<'_>,
    path: &str,
    recurse: bool,
    access: &Access,
    now: DateTime<Utc>,
) -> Result<()> {
    let locks = if recurse {
        get_locks(trail, path, now)?
    } else {
        get_lock(trail, path, now)?.into_iter().collect()
    };
    for lock in &locks {
        verify_lock(lock, access)?;
    }
    Ok(())
}
