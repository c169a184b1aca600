//! On-disk filesystem integration tests

use bsvn_core::{Access, ChangeKind, Filesystem, FsError, NodeKind, Root, PROP_REVISION_AUTHOR};
use chrono::{Duration, Utc};
use tempfile::TempDir;

fn commit_file(fs: &Filesystem, base: u64, path: &str, data: &[u8]) -> u64 {
    let txn = fs.begin_txn(base).unwrap();
    if fs.check_path(&Root::Txn(txn.clone()), path).unwrap().is_none() {
        fs.make_file(&txn, path).unwrap();
    }
    fs.set_file_contents(&txn, path, data).unwrap();
    fs.change_txn_prop(&txn, PROP_REVISION_AUTHOR, Some(b"jrandom")).unwrap();
    fs.commit_txn(&txn, &Access::new("jrandom")).unwrap()
}

#[test]
fn test_first_commit() {
    let temp_dir = TempDir::new().unwrap();
    let fs = Filesystem::create(temp_dir.path()).unwrap();
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    assert!(fs.dir_entries(&Root::Revision(0), "/").unwrap().is_empty());

    assert_eq!(commit_file(&fs, 0, "/iota", b"hello"), 1);
    assert_eq!(fs.youngest_rev().unwrap(), 1);
    assert_eq!(fs.file_contents(&Root::Revision(1), "/iota").unwrap(), b"hello");
}

#[test]
fn test_history_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = {
        let fs = Filesystem::create(temp_dir.path()).unwrap();
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            commit_file(&fs, i as u64, "/iota", text.as_bytes());
        }
        fs.uuid().to_string()
    };

    let fs = Filesystem::open(temp_dir.path()).unwrap();
    assert_eq!(fs.uuid(), uuid);
    assert_eq!(fs.youngest_rev().unwrap(), 3);
    for (rev, text) in [(1, "one"), (2, "two"), (3, "three")] {
        assert_eq!(fs.file_contents(&Root::Revision(rev), "/iota").unwrap(), text.as_bytes());
    }
    let dirent = fs.stat(&Root::Revision(3), "/iota").unwrap();
    assert_eq!(dirent.kind, NodeKind::File);
    assert_eq!(dirent.size, 5);
    assert_eq!(dirent.created_rev, Some(3));
    assert_eq!(dirent.last_author.as_deref(), Some("jrandom"));
    assert_eq!(fs.paths_changed(&Root::Revision(2)).unwrap()["/iota"].kind, ChangeKind::Modify);
}

#[test]
fn test_dated_revision() {
    let temp_dir = TempDir::new().unwrap();
    let fs = Filesystem::create(temp_dir.path()).unwrap();
    commit_file(&fs, 0, "/iota", b"a");
    commit_file(&fs, 1, "/iota", b"b");
    assert_eq!(fs.dated_revision(Utc::now() + Duration::days(1)).unwrap(), 2);
    assert_eq!(fs.dated_revision(Utc::now() - Duration::days(365)).unwrap(), 0);
}

#[test]
fn test_open_transactions_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let txn = {
        let fs = Filesystem::create(temp_dir.path()).unwrap();
        let txn = fs.begin_txn(0).unwrap();
        fs.make_dir(&txn, "/A").unwrap();
        txn
    };
    let fs = Filesystem::open(temp_dir.path()).unwrap();
    assert_eq!(fs.list_txns().unwrap(), vec![txn.clone()]);
    assert_eq!(fs.check_path(&Root::Txn(txn.clone()), "/A").unwrap(), Some(NodeKind::Dir));
    assert_eq!(fs.commit_txn(&txn, &Access::anonymous()).unwrap(), 1);
    assert!(matches!(fs.abort_txn(&txn), Err(FsError::NoSuchTransaction(_))));
}
