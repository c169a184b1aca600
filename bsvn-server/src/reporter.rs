//! The report a client sends before an update-style edit
//!
//! The client describes its working copy with `set-path`, `delete-path` and
//! `link-path`, none of which is answered. The description is mirrored into
//! a scratch transaction based on the revision of the first `set-path`. A
//! failure while mirroring is held back and reported in answer to
//! `finish-report`, which otherwise gets `( success ( ) )`.

use bsvn_core::tree::canonicalize_path;
use bsvn_core::{Filesystem, FsError, NodeKind, Revnum, Root};
use bsvn_ra::{CommandEntry, Conn, Item, RaError, Result, handle_commands, parse_tuple};
use tracing::debug;

/// Mirror state while the report is read
pub struct Report<'a> {
    fs: &'a Filesystem,
    /// Repository path the report's `""` stands for
    root_path: String,
    repos_url: &'a str,
    txn: Option<String>,
    base_rev: Option<Revnum>,
    error: Option<RaError>,
    finished: bool,
}

/// A completed report, ready to be compared against a target tree
#[derive(Debug)]
pub struct ReportedTree {
    pub txn: String,
    pub base_rev: Revnum,
}

impl<'a> Report<'a> {
    pub fn new(fs: &'a Filesystem, root_path: &str, repos_url: &'a str) -> Self {
        Self {
            fs,
            root_path: root_path.to_string(),
            repos_url,
            txn: None,
            base_rev: None,
            error: None,
            finished: false,
        }
    }

    fn full_path(&self, path: &str) -> Result<String> {
        Ok(canonicalize_path(&format!("{}/{}", self.root_path, path))?)
    }

    /// Apply one report step, keeping only the first failure
    fn record(&mut self, step: impl FnOnce(&mut Self) -> Result<()>) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = step(self) {
            debug!("report step failed: {}", e);
            self.error = Some(e);
        }
    }

    fn txn(&self) -> Result<&str> {
        self.txn
            .as_deref()
            .ok_or_else(|| RaError::malformed("report must start with set-path for the root"))
    }

    fn mirror(&mut self, path: &str, src_rev: Revnum, src_path: &str, start_empty: bool) -> Result<()> {
        let full = self.full_path(path)?;
        if self.txn.is_none() {
            if !path.is_empty() {
                return Err(RaError::malformed("report must start with set-path for the root"));
            }
            self.txn = Some(self.fs.begin_txn(src_rev)?);
            self.base_rev = Some(src_rev);
        }
        let txn = self.txn()?.to_string();
        self.fs.link_path(&txn, &full, src_rev, src_path)?;
        if start_empty && self.fs.check_path(&Root::Txn(txn.clone()), &full)? == Some(NodeKind::Dir) {
            self.fs.clear_dir(&txn, &full)?;
        }
        Ok(())
    }

    fn url_to_path(&self, url: &str) -> Result<String> {
        let rest = url
            .strip_prefix(self.repos_url)
            .ok_or_else(|| FsError::PathSyntax(url.to_string()))?;
        Ok(canonicalize_path(rest)?)
    }

    /// Drop the scratch transaction, if one was started
    pub fn discard(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = self.fs.abort_txn(&txn) {
                debug!("failed to abort report transaction {}: {}", txn, e);
            }
        }
    }
}

fn set_path(_conn: &mut Conn, params: &[Item], r: &mut Report<'_>) -> Result<()> {
    let mut t = parse_tuple(params, "crb")?;
    let path = t.req_cstring()?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("set-path needs a revision"))?;
    let start_empty = t.bool()?;
    r.record(|r| {
        let full = r.full_path(&path)?;
        r.mirror(&path, rev, &full, start_empty)
    });
    Ok(())
}

fn delete_path(_conn: &mut Conn, params: &[Item], r: &mut Report<'_>) -> Result<()> {
    let mut t = parse_tuple(params, "c")?;
    let path = t.req_cstring()?;
    r.record(|r| {
        let full = r.full_path(&path)?;
        let txn = r.txn()?.to_string();
        match r.fs.delete(&txn, &full) {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    });
    Ok(())
}

fn link_path(_conn: &mut Conn, params: &[Item], r: &mut Report<'_>) -> Result<()> {
    let mut t = parse_tuple(params, "ccrb")?;
    let path = t.req_cstring()?;
    let url = t.req_cstring()?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("link-path needs a revision"))?;
    let start_empty = t.bool()?;
    r.record(|r| {
        let src = r.url_to_path(&url)?;
        r.mirror(&path, rev, &src, start_empty)
    });
    Ok(())
}

fn finish_report(conn: &mut Conn, params: &[Item], r: &mut Report<'_>) -> Result<()> {
    parse_tuple(params, "")?;
    r.record(|r| r.txn().map(|_| ()));
    match &r.error {
        Some(e) => conn.write_failure(&e.to_chain()),
        None => {
            r.finished = true;
            conn.write_success("", &[])?;
        }
    }
    Ok(())
}

fn abort_report(conn: &mut Conn, params: &[Item], _r: &mut Report<'_>) -> Result<()> {
    parse_tuple(params, "")?;
    conn.write_success("", &[])
}

fn report_commands<'a>() -> Vec<CommandEntry<Report<'a>>> {
    vec![
        CommandEntry::new("set-path", set_path),
        CommandEntry::new("delete-path", delete_path),
        CommandEntry::new("link-path", link_path),
        CommandEntry::terminating("finish-report", finish_report),
        CommandEntry::terminating("abort-report", abort_report),
    ]
}

/// Read a report from `conn`.
///
/// Returns the mirrored tree when the report finished cleanly; `None` when
/// it was aborted or failed, in which case the scratch transaction is gone.
pub fn read_report(conn: &mut Conn, report: &mut Report<'_>) -> Result<Option<ReportedTree>> {
    let commands = report_commands();
    if let Err(e) = handle_commands(conn, &commands, report, false) {
        report.discard();
        return Err(e);
    }
    if !report.finished {
        report.discard();
        return Ok(None);
    }
    match (report.txn.take(), report.base_rev) {
        (Some(txn), Some(base_rev)) => Ok(Some(ReportedTree { txn, base_rev })),
        _ => Ok(None),
    }
}
