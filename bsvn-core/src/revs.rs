//! The revisions table
//!
//! Records are keyed by record number, `rev + 1`, as 8 big-endian bytes, so
//! the last key in the table is always the youngest revision.

use crate::error::{FsError, Result};
use crate::kv::{Table, Trail};
use crate::records::{self, PropList, Revision};
use crate::skel::Skel;
use crate::{PROP_REVISION_DATE, Revnum};
use bytes::Bytes;
use chrono::{DateTime, Utc};

fn record_key(rev: Revnum) -> [u8; 8] {
    (rev + 1).to_be_bytes()
}

fn rev_of_key(key: &[u8]) -> Result<Revnum> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| FsError::Database("malformed key in revisions table".into()))?;
    u64::from_be_bytes(bytes)
        .checked_sub(1)
        .ok_or_else(|| FsError::Database("record number 0 in revisions table".into()))
}

pub fn get_revision(trail: &Trail<'_>, fs_path: &str, rev: Revnum) -> Result<Revision> {
    let data = trail
        .get(Table::Revisions, &record_key(rev))?
        .ok_or(FsError::NoSuchRevision(rev))?;
    let corrupt = |detail: &str| FsError::CorruptRevision {
        rev,
        fs_path: fs_path.to_string(),
        detail: detail.to_string(),
    };
    let skel = Skel::parse(data).ok_or_else(|| corrupt("unparsable record"))?;
    records::parse_revision(&skel).map_err(|e| corrupt(&e.to_string()))
}

/// Overwrite an existing revision record
pub fn put_revision(trail: &Trail<'_>, rev: Revnum, revision: &Revision) -> Result<()> {
    trail.put(
        Table::Revisions,
        &record_key(rev),
        &records::unparse_revision(revision).unparse(),
    )
}

/// Append a revision after the current youngest; returns its number
pub fn append_revision(trail: &Trail<'_>, revision: &Revision) -> Result<Revnum> {
    let rev = match youngest_rev_opt(trail)? {
        Some(y) => y + 1,
        None => 0,
    };
    put_revision(trail, rev, revision)?;
    Ok(rev)
}

fn youngest_rev_opt(trail: &Trail<'_>) -> Result<Option<Revnum>> {
    match trail.cursor(Table::Revisions).last()? {
        Some((key, _)) => rev_of_key(&key).map(Some),
        None => Ok(None),
    }
}

pub fn youngest_rev(trail: &Trail<'_>, fs_path: &str) -> Result<Revnum> {
    youngest_rev_opt(trail)?.ok_or_else(|| FsError::CorruptRevision {
        rev: 0,
        fs_path: fs_path.to_string(),
        detail: "filesystem has no revisions".into(),
    })
}

pub fn rev_proplist(trail: &Trail<'_>, fs_path: &str, rev: Revnum) -> Result<PropList> {
    Ok(get_revision(trail, fs_path, rev)?.props)
}

pub fn rev_prop(trail: &Trail<'_>, fs_path: &str, rev: Revnum, name: &str) -> Result<Option<Bytes>> {
    Ok(get_revision(trail, fs_path, rev)?.props.remove(name))
}

/// Set or (with `None`) delete a revision property, rewriting the record
pub fn change_rev_prop(
    trail: &Trail<'_>,
    fs_path: &str,
    rev: Revnum,
    name: &str,
    value: Option<&[u8]>,
) -> Result<()> {
    let mut revision = get_revision(trail, fs_path, rev)?;
    match value {
        Some(v) => {
            revision.props.insert(name.to_string(), Bytes::copy_from_slice(v));
        }
        None => {
            revision.props.remove(name);
        }
    }
    put_revision(trail, rev, &revision)
}

/// The commit time of a revision. Missing or malformed dates are corruption.
pub fn revision_date(trail: &Trail<'_>, fs_path: &str, rev: Revnum) -> Result<DateTime<Utc>> {
    let revision = get_revision(trail, fs_path, rev)?;
    let corrupt = |detail: String| FsError::CorruptRevision {
        rev,
        fs_path: fs_path.to_string(),
        detail,
    };
    let raw = revision
        .props
        .get(PROP_REVISION_DATE)
        .ok_or_else(|| corrupt(format!("missing {}", PROP_REVISION_DATE)))?;
    let text = std::str::from_utf8(raw).map_err(|_| corrupt(format!("non-UTF-8 {}", PROP_REVISION_DATE)))?;
    records::parse_date(text).map_err(|_| corrupt(format!("malformed {} '{}'", PROP_REVISION_DATE, text)))
}

/// The youngest revision whose date is at or before `when`.
///
/// Revision dates are assumed non-decreasing. A time before revision 0
/// yields revision 0.
pub fn dated_revision(trail: &Trail<'_>, fs_path: &str, when: DateTime<Utc>) -> Result<Revnum> {
    let youngest = youngest_rev(trail, fs_path)?;
    // Invariant: date(lo) <= when, or lo == 0; every rev above hi is later than `when`.
    let (mut lo, mut hi) = (0u64, youngest);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if revision_date(trail, fs_path, mid)? <= when {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::id::Id;
    use crate::kv::Store;
    use chrono::Duration;

    fn revision(date: Option<&str>) -> Revision {
        let mut props = PropList::new();
        if let Some(d) = date {
            props.insert(PROP_REVISION_DATE.into(), Bytes::copy_from_slice(d.as_bytes()));
        }
        Revision {
            txn_id: String::new(),
            root_id: Id::root(),
            props,
        }
    }

    fn store_with_dates(dates: &[DateTime<Utc>]) -> Store {
        let store = Store::open_in_memory(&FsConfig::default()).unwrap();
        store
            .retry_txn(
                |t| {
                    for d in dates {
                        append_revision(t, &revision(Some(&records::format_date(d))))?;
                    }
                    Ok(())
                },
                &|| {},
            )
            .unwrap();
        store
    }

    fn dated(store: &Store, when: DateTime<Utc>) -> Revnum {
        store.retry_txn(|t| dated_revision(t, "/r", when), &|| {}).unwrap()
    }

    #[test]
    fn test_record_numbers_are_one_based() {
        assert_eq!(record_key(0), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(rev_of_key(&record_key(41)).unwrap(), 41);
        assert!(rev_of_key(&[0; 8]).is_err());

        let store = store_with_dates(&[Utc::now(), Utc::now()]);
        let y = store.retry_txn(|t| youngest_rev(t, "/r"), &|| {}).unwrap();
        assert_eq!(y, 1);
        let err = store.retry_txn(|t| get_revision(t, "/r", 2), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::NoSuchRevision(2)));
    }

    #[test]
    fn test_dated_revision_boundaries() {
        let t0 = records::parse_date("2024-01-01T00:00:00.000000Z").unwrap();
        let t1 = t0 + Duration::hours(1);
        let t2 = t0 + Duration::hours(2);
        let store = store_with_dates(&[t0, t1, t2]);
        let eps = Duration::microseconds(1);

        assert_eq!(dated(&store, t1), 1);
        assert_eq!(dated(&store, t1 - eps), 0);
        assert_eq!(dated(&store, t1 + eps), 1);
        assert_eq!(dated(&store, t0 - Duration::days(1)), 0);
        assert_eq!(dated(&store, t2), 2);
        assert_eq!(dated(&store, t2 + Duration::days(365)), 2);
    }

    #[test]
    fn test_missing_or_malformed_date_is_fatal() {
        let store = Store::open_in_memory(&FsConfig::default()).unwrap();
        store
            .retry_txn(
                |t| {
                    append_revision(t, &revision(Some("2024-01-01T00:00:00.000000Z")))?;
                    append_revision(t, &revision(None))?;
                    append_revision(t, &revision(Some("yesterday")))?;
                    Ok(())
                },
                &|| {},
            )
            .unwrap();
        let when = Utc::now();
        let err = store.retry_txn(|t| dated_revision(t, "/r", when), &|| {}).unwrap_err();
        assert!(matches!(err, FsError::CorruptRevision { .. }));
        let err = store.retry_txn(|t| revision_date(t, "/r", 1), &|| {}).unwrap_err();
        assert!(err.to_string().contains("missing svn:date"));
    }

    #[test]
    fn test_rev_props_read_modify_write() {
        let store = store_with_dates(&[Utc::now()]);
        store
            .retry_txn(
                |t| {
                    change_rev_prop(t, "/r", 0, "svn:log", Some(b"msg"))?;
                    assert_eq!(rev_prop(t, "/r", 0, "svn:log")?.as_deref(), Some(&b"msg"[..]));
                    change_rev_prop(t, "/r", 0, "svn:log", None)?;
                    assert_eq!(rev_prop(t, "/r", 0, "svn:log")?, None);
                    assert_eq!(rev_proplist(t, "/r", 0)?.len(), 1);
                    Ok(())
                },
                &|| {},
            )
            .unwrap();
    }
}
