//! The tree editor capability set
//!
//! Anything that produces a tree change (a commit, an update report, a
//! diff) drives an [`Editor`]; anything that consumes one implements it.
//! Neither side cares whether the other end is local or across the wire.
//!
//! Calls arrive in depth-first order: `set_target_revision`, `open_root`,
//! then directory and file calls, each directory and file closed exactly
//! once, and finally `close_edit` or `abort_edit`. Batons are owned by the
//! caller between open and close; closing consumes them.

use crate::error::Result;
use bsvn_core::{Revnum, TxDeltaWindow};

pub trait Editor {
    type Dir;
    type File;

    fn set_target_revision(&mut self, rev: Revnum) -> Result<()>;

    fn open_root(&mut self, base_rev: Option<Revnum>) -> Result<Self::Dir>;

    fn delete_entry(&mut self, path: &str, rev: Option<Revnum>, parent: &mut Self::Dir) -> Result<()>;

    fn add_directory(
        &mut self,
        path: &str,
        parent: &mut Self::Dir,
        copyfrom: Option<(&str, Revnum)>,
    ) -> Result<Self::Dir>;

    fn open_directory(&mut self, path: &str, parent: &mut Self::Dir, base_rev: Option<Revnum>) -> Result<Self::Dir>;

    fn change_dir_prop(&mut self, dir: &mut Self::Dir, name: &str, value: Option<&[u8]>) -> Result<()>;

    fn close_directory(&mut self, dir: Self::Dir) -> Result<()>;

    fn add_file(&mut self, path: &str, parent: &mut Self::Dir, copyfrom: Option<(&str, Revnum)>)
    -> Result<Self::File>;

    fn open_file(&mut self, path: &str, parent: &mut Self::Dir, base_rev: Option<Revnum>) -> Result<Self::File>;

    /// Announce a text delta for `file`. Returns whether the editor wants
    /// the windows; when it does not, no windows follow.
    fn apply_textdelta(&mut self, file: &mut Self::File, base_checksum: Option<&str>) -> Result<bool>;

    /// One delta window, or `None` once the delta is complete
    fn textdelta_window(&mut self, file: &mut Self::File, window: Option<&TxDeltaWindow>) -> Result<()>;

    fn change_file_prop(&mut self, file: &mut Self::File, name: &str, value: Option<&[u8]>) -> Result<()>;

    fn close_file(&mut self, file: Self::File, text_checksum: Option<&str>) -> Result<()>;

    fn close_edit(&mut self) -> Result<()>;

    fn abort_edit(&mut self) -> Result<()>;
}

/// Send `data` to `file` as a complete text delta, if the editor wants one
pub fn send_contents<E: Editor + ?Sized>(
    editor: &mut E,
    file: &mut E::File,
    base_checksum: Option<&str>,
    windows: &[TxDeltaWindow],
) -> Result<()> {
    if editor.apply_textdelta(file, base_checksum)? {
        for window in windows {
            editor.textdelta_window(file, Some(window))?;
        }
        editor.textdelta_window(file, None)?;
    }
    Ok(())
}
