//! Subcommand bodies. Each writes its report to `out`.

use anyhow::{Context, Result, bail};
use bsvn_core::tree::join_path;
use bsvn_core::{Access, Filesystem, NodeKind, PROP_REVISION_LOG, Revnum, Root};
use std::io::Write;
use std::path::Path;
use tracing::info;

pub fn open(repo: &Path) -> Result<Filesystem> {
    Filesystem::open(repo).with_context(|| format!("failed to open repository at {}", repo.display()))
}

fn revision(fs: &Filesystem, rev: Option<Revnum>) -> Result<Revnum> {
    match rev {
        Some(rev) => Ok(rev),
        None => Ok(fs.youngest_rev()?),
    }
}

pub fn create(path: &Path, out: &mut impl Write) -> Result<()> {
    let fs = Filesystem::create(path)
        .with_context(|| format!("failed to create repository at {}", path.display()))?;
    info!("created repository {}", fs.uuid());
    writeln!(out, "Created repository at {} (UUID: {})", path.display(), fs.uuid())?;
    Ok(())
}

pub fn youngest(fs: &Filesystem, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", fs.youngest_rev()?)?;
    Ok(())
}

pub fn cat(fs: &Filesystem, path: &str, rev: Option<Revnum>, out: &mut impl Write) -> Result<()> {
    let root = Root::Revision(revision(fs, rev)?);
    let data = fs
        .file_contents(&root, path)
        .with_context(|| format!("cannot read {}", path))?;
    out.write_all(&data)?;
    Ok(())
}

/// List a directory; `recursive` walks the whole subtree
pub fn ls(
    fs: &Filesystem,
    path: &str,
    rev: Option<Revnum>,
    verbose: bool,
    recursive: bool,
    out: &mut impl Write,
) -> Result<()> {
    let rev = revision(fs, rev)?;
    let root = Root::Revision(rev);
    if fs.check_path(&root, path)? != Some(NodeKind::Dir) {
        bail!("{} is not a directory in r{}", path, rev);
    }
    list_dir(fs, &root, path, "", verbose, recursive, out)
}

fn list_dir(
    fs: &Filesystem,
    root: &Root,
    path: &str,
    prefix: &str,
    verbose: bool,
    recursive: bool,
    out: &mut impl Write,
) -> Result<()> {
    for (name, dirent) in fs.dir_list(root, path)? {
        let shown = format!("{}{}{}", prefix, name, if dirent.kind == NodeKind::Dir { "/" } else { "" });
        if verbose {
            writeln!(
                out,
                "{:>7} {:<12} {:>9} {}",
                dirent.created_rev.map(|r| r.to_string()).unwrap_or_default(),
                dirent.last_author.as_deref().unwrap_or("?"),
                if dirent.kind == NodeKind::File { dirent.size.to_string() } else { String::new() },
                shown
            )?;
        } else {
            writeln!(out, "{}", shown)?;
        }
        if recursive && dirent.kind == NodeKind::Dir {
            list_dir(fs, root, &join_path(path, &name), &shown, verbose, true, out)?;
        }
    }
    Ok(())
}

pub fn lstxns(fs: &Filesystem, out: &mut impl Write) -> Result<()> {
    for txn in fs.list_txns()? {
        writeln!(out, "{}", txn)?;
    }
    Ok(())
}

pub fn rmtxns(fs: &Filesystem, txns: &[String], out: &mut impl Write) -> Result<()> {
    for txn in txns {
        fs.abort_txn(txn)
            .with_context(|| format!("cannot remove transaction {}", txn))?;
        writeln!(out, "Transaction '{}' removed.", txn)?;
    }
    Ok(())
}

pub fn setlog(fs: &Filesystem, rev: Revnum, message: &[u8]) -> Result<()> {
    fs.change_rev_prop(rev, PROP_REVISION_LOG, Some(message))
        .with_context(|| format!("cannot set the log message of r{}", rev))?;
    info!("log message of r{} replaced", rev);
    Ok(())
}

pub fn lslocks(fs: &Filesystem, path: &str, out: &mut impl Write) -> Result<()> {
    for lock in fs.get_locks(path)? {
        writeln!(out, "Path: {}", lock.path)?;
        writeln!(out, "UUID Token: {}", lock.token)?;
        writeln!(out, "Owner: {}", lock.owner)?;
        writeln!(out, "Created: {}", lock.created.format("%Y-%m-%d %H:%M:%S %z"))?;
        match lock.expires {
            Some(expires) => writeln!(out, "Expires: {}", expires.format("%Y-%m-%d %H:%M:%S %z"))?,
            None => writeln!(out, "Expires: ")?,
        }
        let comment = lock.comment.as_deref().unwrap_or("");
        let lines = if comment.is_empty() { 0 } else { comment.lines().count() };
        writeln!(out, "Comment ({} line{}):", lines, if lines == 1 { "" } else { "s" })?;
        writeln!(out, "{}", comment)?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn rmlocks(fs: &Filesystem, paths: &[String], out: &mut impl Write) -> Result<()> {
    for path in paths {
        match fs.get_lock(path)? {
            Some(_) => {
                fs.unlock(path, None, &Access::anonymous(), true)?;
                writeln!(out, "Removed lock on '{}'.", path)?;
            }
            None => writeln!(out, "Path '{}' isn't locked.", path)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsvn_core::PROP_REVISION_AUTHOR;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Filesystem) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo");
        let mut out = Vec::new();
        create(&path, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Created repository"));

        let fs = open(&path).unwrap();
        let txn = fs.begin_txn(0).unwrap();
        fs.make_dir(&txn, "/A").unwrap();
        fs.make_file(&txn, "/A/mu").unwrap();
        fs.set_file_contents(&txn, "/A/mu", b"This is the file 'mu'.\n").unwrap();
        fs.make_file(&txn, "/iota").unwrap();
        fs.change_txn_prop(&txn, PROP_REVISION_AUTHOR, Some(b"harry")).unwrap();
        fs.commit_txn(&txn, &Access::new("harry")).unwrap();
        (dir, fs)
    }

    fn run(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_youngest_and_cat() {
        let (_dir, fs) = repo();
        assert_eq!(run(|o| youngest(&fs, o)), "1\n");
        assert_eq!(run(|o| cat(&fs, "/A/mu", None, o)), "This is the file 'mu'.\n");
        assert!(cat(&fs, "/A/mu", Some(0), &mut Vec::new()).is_err());
    }

    #[test]
    fn test_ls_recursive() {
        let (_dir, fs) = repo();
        assert_eq!(run(|o| ls(&fs, "/", None, false, false, o)), "A/\niota\n");
        assert_eq!(run(|o| ls(&fs, "/", None, false, true, o)), "A/\nA/mu\niota\n");
        let verbose = run(|o| ls(&fs, "/A", None, true, false, o));
        assert!(verbose.contains("harry"));
        assert!(verbose.trim_end().ends_with("mu"));
        assert!(ls(&fs, "/iota", None, false, false, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_transactions_listed_and_removed() {
        let (_dir, fs) = repo();
        let txn = fs.begin_txn(1).unwrap();
        assert_eq!(run(|o| lstxns(&fs, o)), format!("{}\n", txn));
        run(|o| rmtxns(&fs, &[txn.clone()], o));
        assert_eq!(run(|o| lstxns(&fs, o)), "");
        assert!(rmtxns(&fs, &[txn], &mut Vec::new()).is_err());
    }

    #[test]
    fn test_setlog() {
        let (_dir, fs) = repo();
        setlog(&fs, 1, b"fixed message").unwrap();
        assert_eq!(
            fs.revision_prop(1, PROP_REVISION_LOG).unwrap().as_deref(),
            Some(&b"fixed message"[..])
        );
        assert!(setlog(&fs, 7, b"no such revision").is_err());
    }

    #[test]
    fn test_locks_listed_and_removed() {
        let (_dir, fs) = repo();
        fs.lock("/iota", &Access::new("harry"), Some("editing"), None, false)
            .unwrap();
        let listing = run(|o| lslocks(&fs, "/", o));
        assert!(listing.starts_with("Path: /iota\n"));
        assert!(listing.contains("Owner: harry\n"));
        assert!(listing.contains("Comment (1 line):\nediting\n"));

        let removed = run(|o| rmlocks(&fs, &["/iota".to_string(), "/A/mu".to_string()], o));
        assert_eq!(removed, "Removed lock on '/iota'.\nPath '/A/mu' isn't locked.\n");
        assert!(fs.get_lock("/iota").unwrap().is_none());
    }
}
