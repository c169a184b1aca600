//! Editor that builds a transaction and commits it on `close_edit`

use bsvn_core::svndiff::{self, TxDeltaWindow};
use bsvn_core::tree::canonicalize_path;
use bsvn_core::{
    Access, Filesystem, FsError, PROP_REVISION_AUTHOR, PROP_REVISION_DATE, Revnum, Root,
};
use bsvn_ra::{Editor, Result};
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

/// What a successful commit produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub rev: Revnum,
    pub date: Option<String>,
    pub author: Option<String>,
}

pub struct CommitFile {
    path: String,
    /// Text the delta applies to, read when the delta starts
    base: Vec<u8>,
    target: Vec<u8>,
}

pub struct CommitEditor<'a> {
    fs: &'a Filesystem,
    txn: String,
    base_path: String,
    repos_url: String,
    access: Access,
    committed: Option<CommitInfo>,
}

impl<'a> CommitEditor<'a> {
    /// Edit paths are taken relative to `base_path`. Copy sources may be
    /// given as URLs under `repos_url` or as repository paths.
    pub fn new(fs: &'a Filesystem, txn: String, base_path: &str, repos_url: &str, access: Access) -> Self {
        Self {
            fs,
            txn,
            base_path: base_path.to_string(),
            repos_url: repos_url.trim_end_matches('/').to_string(),
            access,
            committed: None,
        }
    }

    pub fn txn(&self) -> &str {
        &self.txn
    }

    pub fn committed(&self) -> Option<&CommitInfo> {
        self.committed.as_ref()
    }

    fn full_path(&self, path: &str) -> Result<String> {
        Ok(canonicalize_path(&format!("{}/{}", self.base_path, path))?)
    }

    fn source_path(&self, copyfrom: &str) -> Result<String> {
        let path = copyfrom.strip_prefix(&self.repos_url).unwrap_or(copyfrom);
        Ok(canonicalize_path(path)?)
    }

    /// Reject changes to a node that has moved on since `rev`
    fn check_out_of_date(&self, path: &str, rev: Option<Revnum>) -> Result<()> {
        let Some(rev) = rev else {
            return Ok(());
        };
        let youngest = self.fs.youngest_rev()?;
        let root = Root::Revision(youngest);
        if self.fs.check_path(&root, path)?.is_none() {
            return Err(FsError::NotFound(path.to_string()).into());
        }
        match self.fs.node_created_rev(&root, path)? {
            Some(created) if created > rev => Err(FsError::Conflict(path.to_string()).into()),
            _ => Ok(()),
        }
    }

    fn add_node(&mut self, path: &str, copyfrom: Option<(&str, Revnum)>, dir: bool) -> Result<String> {
        let full = self.full_path(path)?;
        match copyfrom {
            Some((src, rev)) => {
                let src = self.source_path(src)?;
                self.fs.copy(rev, &src, &self.txn, &full)?;
            }
            None if dir => self.fs.make_dir(&self.txn, &full)?,
            None => self.fs.make_file(&self.txn, &full)?,
        }
        Ok(full)
    }
}

impl Editor for CommitEditor<'_> {
    type Dir = String;
    type File = CommitFile;

    fn set_target_revision(&mut self, _rev: Revnum) -> Result<()> {
        Ok(())
    }

    fn open_root(&mut self, _base_rev: Option<Revnum>) -> Result<String> {
        Ok(canonicalize_path(&self.base_path)?)
    }

    fn delete_entry(&mut self, path: &str, rev: Option<Revnum>, _parent: &mut String) -> Result<()> {
        let full = self.full_path(path)?;
        self.check_out_of_date(&full, rev)?;
        self.fs.delete(&self.txn, &full)?;
        Ok(())
    }

    fn add_directory(&mut self, path: &str, _parent: &mut String, copyfrom: Option<(&str, Revnum)>) -> Result<String> {
        self.add_node(path, copyfrom, true)
    }

    fn open_directory(&mut self, path: &str, _parent: &mut String, base_rev: Option<Revnum>) -> Result<String> {
        let full = self.full_path(path)?;
        self.check_out_of_date(&full, base_rev)?;
        Ok(full)
    }

    fn change_dir_prop(&mut self, dir: &mut String, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.fs.change_node_prop(&self.txn, dir, name, value)?;
        Ok(())
    }

    fn close_directory(&mut self, _dir: String) -> Result<()> {
        Ok(())
    }

    fn add_file(&mut self, path: &str, _parent: &mut String, copyfrom: Option<(&str, Revnum)>) -> Result<CommitFile> {
        let path = self.add_node(path, copyfrom, false)?;
        Ok(CommitFile {
            path,
            base: Vec::new(),
            target: Vec::new(),
        })
    }

    fn open_file(&mut self, path: &str, _parent: &mut String, base_rev: Option<Revnum>) -> Result<CommitFile> {
        let path = self.full_path(path)?;
        self.check_out_of_date(&path, base_rev)?;
        Ok(CommitFile {
            path,
            base: Vec::new(),
            target: Vec::new(),
        })
    }

    fn apply_textdelta(&mut self, file: &mut CommitFile, base_checksum: Option<&str>) -> Result<bool> {
        let base = self.fs.file_contents(&Root::Txn(self.txn.clone()), &file.path)?;
        if let Some(expected) = base_checksum {
            let actual = hex::encode(Md5::digest(&base));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FsError::ChecksumMismatch {
                    path: file.path.clone(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }
        file.base = base;
        file.target.clear();
        Ok(true)
    }

    fn textdelta_window(&mut self, file: &mut CommitFile, window: Option<&TxDeltaWindow>) -> Result<()> {
        match window {
            Some(w) => {
                let view = svndiff::source_view(&file.base, w)?;
                let text = w.apply(view)?;
                file.target.extend_from_slice(&text);
            }
            None => {
                self.fs.set_file_contents(&self.txn, &file.path, &file.target)?;
                file.base.clear();
            }
        }
        Ok(())
    }

    fn change_file_prop(&mut self, file: &mut CommitFile, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.fs.change_node_prop(&self.txn, &file.path, name, value)?;
        Ok(())
    }

    fn close_file(&mut self, file: CommitFile, text_checksum: Option<&str>) -> Result<()> {
        if let Some(expected) = text_checksum {
            let actual = hex::encode(self.fs.file_md5(&Root::Txn(self.txn.clone()), &file.path)?);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FsError::ChecksumMismatch {
                    path: file.path,
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    fn close_edit(&mut self) -> Result<()> {
        let rev = match self.fs.commit_txn(&self.txn, &self.access) {
            Ok(rev) => rev,
            Err(e) => {
                debug!("commit of {} failed: {}", self.txn, e);
                if let Err(abort) = self.fs.abort_txn(&self.txn) {
                    warn!("could not abort transaction {}: {}", self.txn, abort);
                }
                return Err(e.into());
            }
        };
        let props = self.fs.revision_proplist(rev)?;
        let text = |name: &str| props.get(name).map(|v| String::from_utf8_lossy(v).into_owned());
        self.committed = Some(CommitInfo {
            rev,
            date: text(PROP_REVISION_DATE),
            author: text(PROP_REVISION_AUTHOR),
        });
        info!("committed revision {} over the wire", rev);
        Ok(())
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.fs.abort_txn(&self.txn)?;
        Ok(())
    }
}
