//! Editors over the wire
//!
//! [`WireEditor`] turns editor calls into edit commands, each answered by
//! its own response. [`drive_editor`] runs the other end: it reads edit
//! commands and calls a local editor.
//!
//! Directory and file batons travel as string tokens. A directory token is
//! tied to its parent: a directory cannot be closed while directories
//! opened under it are still open. File tokens stand alone and may be
//! closed after their parent directory.

use crate::delta::Editor;
use crate::dispatch::{CommandEntry, handle_commands};
use crate::error::{CommandResultExt, RaError, Result};
use crate::marshal::{Arg, Conn, Item, Tuple, parse_tuple};
use bsvn_core::svndiff::{self, Decoder};
use bsvn_core::{Revnum, TxDeltaWindow};
use std::collections::HashMap;
use tracing::debug;

// ---- consumer ----

/// A file opened through a [`WireEditor`]
#[derive(Debug)]
pub struct WireFile {
    token: String,
    sending: bool,
    header_sent: bool,
}

impl WireFile {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Editor that forwards every call to the peer
pub struct WireEditor<'a> {
    conn: &'a mut Conn,
    next_token: u64,
}

impl<'a> WireEditor<'a> {
    pub fn new(conn: &'a mut Conn) -> Self {
        Self { conn, next_token: 0 }
    }

    fn make_token(&mut self, prefix: char) -> String {
        let token = format!("{}{}", prefix, self.next_token);
        self.next_token += 1;
        token
    }

    fn call(&mut self, name: &str, fmt: &str, args: &[Arg<'_>]) -> Result<Tuple> {
        self.conn.write_command(name, fmt, args)?;
        self.conn.read_response("")
    }

    fn send_chunk(&mut self, file: &mut WireFile, window: Option<&TxDeltaWindow>) {
        let mut buf = Vec::new();
        if !file.header_sent {
            buf.extend_from_slice(svndiff::HEADER);
            file.header_sent = true;
        }
        if let Some(w) = window {
            svndiff::encode_window(w, &mut buf);
        }
        if !buf.is_empty() {
            self.conn.write_string(&buf);
        }
    }
}

fn copy_args(copyfrom: Option<(&str, Revnum)>) -> [Arg<'_>; 2] {
    match copyfrom {
        Some((path, rev)) => [Arg::CStr(Some(path)), Arg::Rev(Some(rev))],
        None => [Arg::CStr(None), Arg::Rev(None)],
    }
}

impl Editor for WireEditor<'_> {
    type Dir = String;
    type File = WireFile;

    fn set_target_revision(&mut self, rev: Revnum) -> Result<()> {
        self.call("target-rev", "r", &[Arg::Rev(Some(rev))])?;
        Ok(())
    }

    fn open_root(&mut self, base_rev: Option<Revnum>) -> Result<String> {
        let token = self.make_token('d');
        self.call("open-root", "(?r)c", &[Arg::Rev(base_rev), Arg::CStr(Some(&token))])?;
        Ok(token)
    }

    fn delete_entry(&mut self, path: &str, rev: Option<Revnum>, parent: &mut String) -> Result<()> {
        self.call(
            "delete-entry",
            "c(?r)c",
            &[Arg::CStr(Some(path)), Arg::Rev(rev), Arg::CStr(Some(parent))],
        )?;
        Ok(())
    }

    fn add_directory(&mut self, path: &str, parent: &mut String, copyfrom: Option<(&str, Revnum)>) -> Result<String> {
        let token = self.make_token('d');
        let [copy_path, copy_rev] = copy_args(copyfrom);
        self.call(
            "add-dir",
            "ccc(?cr)",
            &[
                Arg::CStr(Some(path)),
                Arg::CStr(Some(parent)),
                Arg::CStr(Some(&token)),
                copy_path,
                copy_rev,
            ],
        )?;
        Ok(token)
    }

    fn open_directory(&mut self, path: &str, parent: &mut String, base_rev: Option<Revnum>) -> Result<String> {
        let token = self.make_token('d');
        self.call(
            "open-dir",
            "ccc(?r)",
            &[
                Arg::CStr(Some(path)),
                Arg::CStr(Some(parent)),
                Arg::CStr(Some(&token)),
                Arg::Rev(base_rev),
            ],
        )?;
        Ok(token)
    }

    fn change_dir_prop(&mut self, dir: &mut String, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.call(
            "change-dir-prop",
            "cc(?s)",
            &[Arg::CStr(Some(dir)), Arg::CStr(Some(name)), Arg::Str(value)],
        )?;
        Ok(())
    }

    fn close_directory(&mut self, dir: String) -> Result<()> {
        self.call("close-dir", "c", &[Arg::CStr(Some(&dir))])?;
        Ok(())
    }

    fn add_file(&mut self, path: &str, parent: &mut String, copyfrom: Option<(&str, Revnum)>) -> Result<WireFile> {
        let token = self.make_token('f');
        let [copy_path, copy_rev] = copy_args(copyfrom);
        self.call(
            "add-file",
            "ccc(?cr)",
            &[
                Arg::CStr(Some(path)),
                Arg::CStr(Some(parent)),
                Arg::CStr(Some(&token)),
                copy_path,
                copy_rev,
            ],
        )?;
        Ok(WireFile {
            token,
            sending: false,
            header_sent: false,
        })
    }

    fn open_file(&mut self, path: &str, parent: &mut String, base_rev: Option<Revnum>) -> Result<WireFile> {
        let token = self.make_token('f');
        self.call(
            "open-file",
            "ccc(?r)",
            &[
                Arg::CStr(Some(path)),
                Arg::CStr(Some(parent)),
                Arg::CStr(Some(&token)),
                Arg::Rev(base_rev),
            ],
        )?;
        Ok(WireFile {
            token,
            sending: false,
            header_sent: false,
        })
    }

    fn apply_textdelta(&mut self, file: &mut WireFile, base_checksum: Option<&str>) -> Result<bool> {
        self.conn.write_command(
            "apply-textdelta",
            "c(?c)",
            &[Arg::CStr(Some(&file.token)), Arg::CStr(base_checksum)],
        )?;
        let wanted = self.conn.read_response("b")?.bool()?;
        file.sending = wanted;
        file.header_sent = false;
        Ok(wanted)
    }

    fn textdelta_window(&mut self, file: &mut WireFile, window: Option<&TxDeltaWindow>) -> Result<()> {
        if !file.sending {
            return Ok(());
        }
        self.send_chunk(file, window);
        if window.is_none() {
            file.sending = false;
            self.conn.write_string(b"");
            self.conn.read_response("")?;
        }
        Ok(())
    }

    fn change_file_prop(&mut self, file: &mut WireFile, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.call(
            "change-file-prop",
            "cc(?s)",
            &[Arg::CStr(Some(&file.token)), Arg::CStr(Some(name)), Arg::Str(value)],
        )?;
        Ok(())
    }

    fn close_file(&mut self, file: WireFile, text_checksum: Option<&str>) -> Result<()> {
        self.call(
            "close-file",
            "c(?c)",
            &[Arg::CStr(Some(&file.token)), Arg::CStr(text_checksum)],
        )?;
        Ok(())
    }

    fn close_edit(&mut self) -> Result<()> {
        self.call("close-edit", "", &[])?;
        Ok(())
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.call("abort-edit", "", &[])?;
        Ok(())
    }
}

// ---- driver ----

/// How an edit driven from the wire ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Completed,
    Aborted,
}

struct OpenDir<D> {
    baton: D,
    parent: Option<String>,
    open_children: usize,
}

pub struct DriverState<'e, E: Editor> {
    editor: &'e mut E,
    dirs: HashMap<String, OpenDir<E::Dir>>,
    files: HashMap<String, E::File>,
    outcome: Option<EditOutcome>,
}

fn invalid_token(token: &str) -> RaError {
    RaError::malformed(format!("invalid file or dir token '{}'", token))
}

/// The nested tuple at the front of `t`
fn inner(t: &mut Tuple) -> Result<Tuple> {
    t.tuple()?
        .ok_or_else(|| RaError::InvalidFormat("nested tuple is absent".into()))
}

fn copyfrom(t: &mut Tuple) -> Result<Option<(String, Revnum)>> {
    let mut copy = inner(t)?;
    match (copy.cstring()?, copy.rev()?) {
        (Some(path), Some(rev)) => Ok(Some((path, rev))),
        _ => Ok(None),
    }
}

impl<E: Editor> DriverState<'_, E> {
    fn dir(&mut self, token: &str) -> Result<&mut OpenDir<E::Dir>> {
        self.dirs.get_mut(token).ok_or_else(|| invalid_token(token))
    }

    fn check_new_token(&self, token: &str) -> Result<()> {
        if self.dirs.contains_key(token) || self.files.contains_key(token) {
            return Err(RaError::malformed(format!("token '{}' is already open", token)));
        }
        Ok(())
    }
}

fn target_rev<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "r")?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("target revision missing"))?;
    st.editor.set_target_revision(rev).cmd_err()?;
    conn.write_success("", &[])
}

fn open_root<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "(?r)c")?;
    let base_rev = inner(&mut t)?.rev()?;
    let token = t.req_cstring()?;
    st.check_new_token(&token)?;
    let baton = st.editor.open_root(base_rev).cmd_err()?;
    st.dirs.insert(
        token,
        OpenDir {
            baton,
            parent: None,
            open_children: 0,
        },
    );
    conn.write_success("", &[])
}

fn delete_entry<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "c(?r)c")?;
    let path = t.req_cstring()?;
    let rev = inner(&mut t)?.rev()?;
    let token = t.req_cstring()?;
    let dir = st.dirs.get_mut(&token).ok_or_else(|| invalid_token(&token))?;
    st.editor.delete_entry(&path, rev, &mut dir.baton).cmd_err()?;
    conn.write_success("", &[])
}

enum DirOpen {
    Add(Option<(String, Revnum)>),
    Open(Option<Revnum>),
}

fn open_child_dir<E: Editor>(
    conn: &mut Conn,
    st: &mut DriverState<'_, E>,
    path: &str,
    parent: String,
    child: String,
    how: DirOpen,
) -> Result<()> {
    st.check_new_token(&child)?;
    let dir = st.dirs.get_mut(&parent).ok_or_else(|| invalid_token(&parent))?;
    let baton = match how {
        DirOpen::Add(copy) => st
            .editor
            .add_directory(path, &mut dir.baton, copy.as_ref().map(|(p, r)| (p.as_str(), *r))),
        DirOpen::Open(base_rev) => st.editor.open_directory(path, &mut dir.baton, base_rev),
    }
    .cmd_err()?;
    dir.open_children += 1;
    st.dirs.insert(
        child,
        OpenDir {
            baton,
            parent: Some(parent),
            open_children: 0,
        },
    );
    conn.write_success("", &[])
}

fn add_dir<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "ccc(?cr)")?;
    let path = t.req_cstring()?;
    let parent = t.req_cstring()?;
    let child = t.req_cstring()?;
    let copy = copyfrom(&mut t)?;
    open_child_dir(conn, st, &path, parent, child, DirOpen::Add(copy))
}

fn open_dir<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "ccc(?r)")?;
    let path = t.req_cstring()?;
    let parent = t.req_cstring()?;
    let child = t.req_cstring()?;
    let base_rev = inner(&mut t)?.rev()?;
    open_child_dir(conn, st, &path, parent, child, DirOpen::Open(base_rev))
}

fn change_dir_prop<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "cc(?s)")?;
    let token = t.req_cstring()?;
    let name = t.req_cstring()?;
    let value = inner(&mut t)?.string()?;
    let dir = st.dirs.get_mut(&token).ok_or_else(|| invalid_token(&token))?;
    st.editor
        .change_dir_prop(&mut dir.baton, &name, value.as_deref())
        .cmd_err()?;
    conn.write_success("", &[])
}

fn close_dir<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "c")?;
    let token = t.req_cstring()?;
    if st.dir(&token)?.open_children > 0 {
        return Err(RaError::malformed(format!(
            "directory token '{}' closed before its children",
            token
        )));
    }
    let dir = st.dirs.remove(&token).ok_or_else(|| invalid_token(&token))?;
    if let Some(parent) = &dir.parent {
        if let Some(p) = st.dirs.get_mut(parent) {
            p.open_children = p.open_children.saturating_sub(1);
        }
    }
    st.editor.close_directory(dir.baton).cmd_err()?;
    conn.write_success("", &[])
}

fn open_child_file<E: Editor>(
    conn: &mut Conn,
    st: &mut DriverState<'_, E>,
    path: &str,
    parent: String,
    token: String,
    how: DirOpen,
) -> Result<()> {
    st.check_new_token(&token)?;
    let dir = st.dirs.get_mut(&parent).ok_or_else(|| invalid_token(&parent))?;
    let file = match how {
        DirOpen::Add(copy) => st
            .editor
            .add_file(path, &mut dir.baton, copy.as_ref().map(|(p, r)| (p.as_str(), *r))),
        DirOpen::Open(base_rev) => st.editor.open_file(path, &mut dir.baton, base_rev),
    }
    .cmd_err()?;
    st.files.insert(token, file);
    conn.write_success("", &[])
}

fn add_file<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "ccc(?cr)")?;
    let path = t.req_cstring()?;
    let parent = t.req_cstring()?;
    let token = t.req_cstring()?;
    let copy = copyfrom(&mut t)?;
    open_child_file(conn, st, &path, parent, token, DirOpen::Add(copy))
}

fn open_file<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "ccc(?r)")?;
    let path = t.req_cstring()?;
    let parent = t.req_cstring()?;
    let token = t.req_cstring()?;
    let base_rev = inner(&mut t)?.rev()?;
    open_child_file(conn, st, &path, parent, token, DirOpen::Open(base_rev))
}

fn apply_textdelta<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "c(?c)")?;
    let token = t.req_cstring()?;
    let base_checksum = inner(&mut t)?.cstring()?;
    let file = st.files.get_mut(&token).ok_or_else(|| invalid_token(&token))?;
    let wanted = st.editor.apply_textdelta(file, base_checksum.as_deref()).cmd_err()?;
    conn.write_success("b", &[Arg::Bool(wanted)])?;
    if !wanted {
        return Ok(());
    }

    // Drain the whole chunk stream even after a failure so the next
    // command starts on a clean boundary.
    let mut decoder = Decoder::new();
    let mut failure: Option<RaError> = None;
    loop {
        let chunk = match conn.read_item()? {
            Item::String(s) => s,
            other => {
                return Err(RaError::malformed(format!(
                    "expected a delta chunk, found {}",
                    other.kind_name()
                )));
            }
        };
        if chunk.is_empty() {
            break;
        }
        if failure.is_some() {
            continue;
        }
        match decoder.feed(&chunk) {
            Ok(windows) => {
                for window in &windows {
                    if let Err(e) = st.editor.textdelta_window(file, Some(window)) {
                        failure = Some(e);
                        break;
                    }
                }
            }
            Err(e) => failure = Some(e.into()),
        }
    }
    if let Some(e) = failure {
        return Err::<(), _>(e).cmd_err();
    }
    decoder.finish().cmd_err()?;
    st.editor.textdelta_window(file, None).cmd_err()?;
    conn.write_success("", &[])
}

fn change_file_prop<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "cc(?s)")?;
    let token = t.req_cstring()?;
    let name = t.req_cstring()?;
    let value = inner(&mut t)?.string()?;
    let file = st.files.get_mut(&token).ok_or_else(|| invalid_token(&token))?;
    st.editor.change_file_prop(file, &name, value.as_deref()).cmd_err()?;
    conn.write_success("", &[])
}

fn close_file<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    let mut t = parse_tuple(params, "c(?c)")?;
    let token = t.req_cstring()?;
    let checksum = inner(&mut t)?.cstring()?;
    let file = st.files.remove(&token).ok_or_else(|| invalid_token(&token))?;
    st.editor.close_file(file, checksum.as_deref()).cmd_err()?;
    conn.write_success("", &[])
}

fn close_edit<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    parse_tuple(params, "")?;
    if !st.dirs.is_empty() || !st.files.is_empty() {
        st.outcome = Some(EditOutcome::Aborted);
        return Err(RaError::malformed(format!(
            "close-edit with {} directories and {} files still open",
            st.dirs.len(),
            st.files.len()
        )));
    }
    let result = st.editor.close_edit();
    st.outcome = Some(if result.is_ok() {
        EditOutcome::Completed
    } else {
        EditOutcome::Aborted
    });
    result.cmd_err()?;
    conn.write_success("", &[])
}

fn abort_edit<E: Editor>(conn: &mut Conn, params: &[Item], st: &mut DriverState<'_, E>) -> Result<()> {
    parse_tuple(params, "")?;
    st.outcome = Some(EditOutcome::Aborted);
    st.editor.abort_edit().cmd_err()?;
    conn.write_success("", &[])
}

fn editor_commands<'e, E: Editor>() -> Vec<CommandEntry<DriverState<'e, E>>> {
    vec![
        CommandEntry::new("target-rev", target_rev::<E>),
        CommandEntry::new("open-root", open_root::<E>),
        CommandEntry::new("delete-entry", delete_entry::<E>),
        CommandEntry::new("add-dir", add_dir::<E>),
        CommandEntry::new("open-dir", open_dir::<E>),
        CommandEntry::new("change-dir-prop", change_dir_prop::<E>),
        CommandEntry::new("close-dir", close_dir::<E>),
        CommandEntry::new("add-file", add_file::<E>),
        CommandEntry::new("open-file", open_file::<E>),
        CommandEntry::new("apply-textdelta", apply_textdelta::<E>),
        CommandEntry::new("change-file-prop", change_file_prop::<E>),
        CommandEntry::new("close-file", close_file::<E>),
        CommandEntry::terminating("close-edit", close_edit::<E>),
        CommandEntry::terminating("abort-edit", abort_edit::<E>),
    ]
}

/// Read edit commands from `conn` and apply them to `editor` until the edit
/// is closed or aborted.
pub fn drive_editor<E: Editor>(conn: &mut Conn, editor: &mut E) -> Result<EditOutcome> {
    let mut state = DriverState {
        editor,
        dirs: HashMap::new(),
        files: HashMap::new(),
        outcome: None,
    };
    let commands = editor_commands::<E>();
    handle_commands(conn, &commands, &mut state, false)?;
    let outcome = state.outcome.unwrap_or(EditOutcome::Aborted);
    if !state.dirs.is_empty() || !state.files.is_empty() {
        debug!(
            "edit aborted with {} directories and {} files still open",
            state.dirs.len(),
            state.files.len()
        );
    }
    Ok(outcome)
}
