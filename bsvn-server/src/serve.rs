//! One client session: greeting, authentication, repository lookup and the
//! command loop

use crate::auth;
use crate::commit_editor::CommitEditor;
use crate::config::{AccessLevel, ServeConfig};
use crate::reporter::{Report, read_report};
use crate::tree_delta::{DeltaParams, drive_tree_delta};
use bsvn_core::fs::DB_FILE;
use bsvn_core::records::{format_date, parse_date};
use bsvn_core::tree::{canonicalize_path, is_below};
use bsvn_core::{
    Access, Dirent, Filesystem, FsError, Lock, NodeKind, PROP_REVISION_AUTHOR, PROP_REVISION_DATE,
    PROP_REVISION_LOG, PropList, Revnum, Root,
};
use bsvn_ra::{
    Arg, CommandEntry, CommandResultExt, Conn, EditOutcome, Item, RaError, Result, WireEditor, drive_editor,
    handle_commands, parse_tuple,
};
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub const PROTOCOL_MIN_VERSION: u64 = 1;
pub const PROTOCOL_MAX_VERSION: u64 = 2;

/// File contents are streamed in strings of at most this many bytes
const FILE_CHUNK: usize = 16 * 1024;

const CAPABILITIES: &[&str] = &["edit-pipeline", "svndiff0"];

/// What every connection shares
#[derive(Debug, Clone)]
pub struct ServeContext {
    /// Directory the repositories live under
    pub root: PathBuf,
    pub config: ServeConfig,
    pub shutdown: Arc<AtomicBool>,
}

impl ServeContext {
    pub fn new(root: impl Into<PathBuf>, config: ServeConfig) -> Self {
        Self {
            root: root.into(),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct Session {
    fs: Filesystem,
    /// URL of the repository root, without a trailing slash
    repos_url: String,
    /// Repository path the session URL points at
    base_path: String,
    user: Option<String>,
    access: AccessLevel,
    shutdown: Arc<AtomicBool>,
}

impl Session {
    pub fn fs(&self) -> &Filesystem {
        &self.fs
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn full_path(&self, path: &str) -> Result<String> {
        canonicalize_path(&format!("{}/{}", self.base_path, path)).cmd_err()
    }

    fn require(&self, level: AccessLevel) -> Result<()> {
        if self.access >= level {
            return Ok(());
        }
        let who = self.user.as_deref().unwrap_or("anonymous");
        Err(RaError::NotAuthorized(format!("{} access denied for {}", level_name(level), who))).cmd_err()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(FsError::Cancelled.into());
        }
        Ok(())
    }

    fn rev_or_youngest(&self, rev: Option<Revnum>) -> Result<Revnum> {
        let youngest = self.fs.youngest_rev().cmd_err()?;
        match rev {
            None => Ok(youngest),
            Some(rev) if rev <= youngest => Ok(rev),
            Some(rev) => Err(FsError::NoSuchRevision(rev)).cmd_err(),
        }
    }

    fn access_baton(&self) -> Access {
        match &self.user {
            Some(user) => Access::new(user.clone()),
            None => Access::anonymous(),
        }
    }

    fn url_to_path(&self, url: &str) -> Result<String> {
        match url.strip_prefix(&self.repos_url) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => canonicalize_path(rest).cmd_err(),
            _ => Err(FsError::PathSyntax(url.to_string())).cmd_err(),
        }
    }
}

fn level_name(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::None => "no",
        AccessLevel::Read => "read",
        AccessLevel::Write => "write",
    }
}

// ---- handshake ----

/// Split `svn://host[:port]/path` into `svn://host[:port]` and `/path`
fn split_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("svn://")?;
    let slash = rest.find('/').unwrap_or(rest.len());
    let authority_end = "svn://".len() + slash;
    let path = &url[authority_end..];
    Some((&url[..authority_end], if path.is_empty() { "/" } else { path }))
}

/// Find the repository holding `url_path` under `root`.
///
/// Returns the repository directory, its URL path prefix and the path
/// inside the repository.
pub fn find_repository(root: &Path, url_path: &str) -> Option<(PathBuf, String, String)> {
    let components: Vec<&str> = url_path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    if components.contains(&"..") {
        return None;
    }
    for split in (0..=components.len()).rev() {
        let dir = components[..split].iter().fold(root.to_path_buf(), |d, c| d.join(c));
        if dir.join(DB_FILE).is_file() {
            let prefix: String = components[..split].iter().map(|c| format!("/{}", c)).collect();
            let inner: String = components[split..].iter().map(|c| format!("/{}", c)).collect();
            let inner = if inner.is_empty() { "/".to_string() } else { inner };
            return Some((dir, prefix, inner));
        }
    }
    None
}

fn fail(conn: &mut Conn, err: RaError) -> RaError {
    conn.write_failure(&err.to_chain());
    if let Err(e) = conn.flush() {
        debug!("failed to report handshake error: {}", e);
    }
    err
}

/// Greet the client, authenticate it and open the repository it names
pub fn handshake(conn: &mut Conn, ctx: &ServeContext) -> Result<Session> {
    let mechs: Vec<Item> = auth::mechanisms(&ctx.config).into_iter().map(Item::word).collect();
    let caps: Vec<Item> = CAPABILITIES.iter().copied().map(Item::word).collect();
    conn.write_success(
        "nnll",
        &[
            Arg::Number(PROTOCOL_MIN_VERSION),
            Arg::Number(PROTOCOL_MAX_VERSION),
            Arg::List(&mechs),
            Arg::List(&caps),
        ],
    )?;

    let mut t = conn.read_tuple("nw(?s)l")?;
    let version = t.number()?;
    let mech = t.req_word()?;
    if !(PROTOCOL_MIN_VERSION..=PROTOCOL_MAX_VERSION).contains(&version) {
        return Err(fail(conn, RaError::BadVersion(version)));
    }

    let user = match auth::authenticate(conn, &ctx.config, &mech) {
        Ok(user) => user,
        Err(e) => return Err(fail(conn, e)),
    };
    let access = if user.is_some() {
        ctx.config.general.auth_access
    } else {
        ctx.config.general.anon_access
    };

    let url = conn.read_tuple("c")?.req_cstring()?;
    let Some((authority, url_path)) = split_url(&url) else {
        return Err(fail(conn, RaError::ReposNotFound(url)));
    };
    let Some((dir, prefix, base_path)) = find_repository(&ctx.root, url_path) else {
        return Err(fail(conn, RaError::ReposNotFound(url.clone())));
    };
    let fs = match Filesystem::open(&dir) {
        Ok(fs) => fs,
        Err(e) => return Err(fail(conn, e.into())),
    };
    let repos_url = format!("{}{}", authority, prefix);
    conn.write_success("cc", &[Arg::CStr(Some(&repos_url)), Arg::CStr(Some(fs.uuid()))])?;
    info!(
        "session opened on {} for {}",
        repos_url,
        user.as_deref().unwrap_or("anonymous")
    );

    Ok(Session {
        fs,
        repos_url,
        base_path,
        user,
        access,
        shutdown: ctx.shutdown.clone(),
    })
}

/// Serve one connection until the client hangs up
pub fn serve_connection(conn: &mut Conn, ctx: &ServeContext) -> Result<()> {
    let mut session = handshake(conn, ctx)?;
    match handle_commands(conn, COMMANDS, &mut session, false) {
        Ok(()) | Err(RaError::ConnectionClosed) => {
            info!("session on {} closed", session.repos_url);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ---- item builders ----

fn prop_items(props: &PropList) -> Vec<Item> {
    props
        .iter()
        .map(|(name, value)| Item::List(vec![Item::str(name), Item::string(value.clone())]))
        .collect()
}

fn optional(item: Option<Item>) -> Item {
    Item::List(item.into_iter().collect())
}

/// The node's own properties plus the `svn:entry:` ones describing its
/// last change
fn entry_props(fs: &Filesystem, root: &Root, path: &str, dirent: &Dirent) -> Result<PropList> {
    let mut props = fs.node_proplist(root, path).cmd_err()?;
    if let Some(rev) = dirent.created_rev {
        props.insert("svn:entry:committed-rev".into(), rev.to_string().into());
    }
    if let Some(date) = &dirent.time {
        props.insert("svn:entry:committed-date".into(), date.clone().into());
    }
    if let Some(author) = &dirent.last_author {
        props.insert("svn:entry:last-author".into(), author.clone().into());
    }
    Ok(props)
}

fn dirent_item(name: &str, dirent: &Dirent) -> Item {
    Item::List(vec![
        Item::str(name),
        Item::word(dirent.kind.as_str()),
        Item::Number(dirent.size),
        Item::bool(dirent.has_props),
        Item::Number(dirent.created_rev.unwrap_or(0)),
        optional(dirent.time.as_deref().map(Item::str)),
        optional(dirent.last_author.as_deref().map(Item::str)),
    ])
}

fn lock_item(lock: &Lock) -> Item {
    Item::List(vec![
        Item::str(&lock.path),
        Item::str(&lock.token),
        Item::str(&lock.owner),
        optional(lock.comment.as_deref().map(Item::str)),
        Item::str(&format_date(&lock.created)),
        optional(lock.expires.as_ref().map(|e| Item::str(&format_date(e)))),
    ])
}

/// The nested tuple holding an optional field
fn inner(t: &mut bsvn_ra::Tuple) -> Result<bsvn_ra::Tuple> {
    t.tuple()?
        .ok_or_else(|| RaError::InvalidFormat("nested tuple is absent".into()))
}

// ---- commands ----

fn get_latest_rev(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    parse_tuple(params, "")?;
    s.require(AccessLevel::Read)?;
    let rev = s.fs.youngest_rev().cmd_err()?;
    conn.write_success("r", &[Arg::Rev(Some(rev))])
}

fn get_dated_rev(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c")?;
    let date = t.req_cstring()?;
    s.require(AccessLevel::Read)?;
    let when = parse_date(&date).cmd_err()?;
    let rev = s.fs.dated_revision(when).cmd_err()?;
    conn.write_success("r", &[Arg::Rev(Some(rev))])
}

fn change_rev_prop(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "rc(?s)")?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("revision missing"))?;
    let name = t.req_cstring()?;
    let value = inner(&mut t)?.string()?;
    s.require(AccessLevel::Write)?;
    s.fs.change_rev_prop(rev, &name, value.as_deref()).cmd_err()?;
    conn.write_success("", &[])
}

fn rev_proplist(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "r")?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("revision missing"))?;
    s.require(AccessLevel::Read)?;
    let props = s.fs.revision_proplist(rev).cmd_err()?;
    conn.write_success("l", &[Arg::List(&prop_items(&props))])
}

fn rev_prop(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "rc")?;
    let rev = t.rev()?.ok_or_else(|| RaError::malformed("revision missing"))?;
    let name = t.req_cstring()?;
    s.require(AccessLevel::Read)?;
    let value = s.fs.revision_prop(rev, &name).cmd_err()?;
    conn.write_success("(?s)", &[Arg::Str(value.as_deref())])
}

fn check_path(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c(?r)")?;
    let path = s.full_path(&t.req_cstring()?)?;
    let rev = inner(&mut t)?.rev()?;
    s.require(AccessLevel::Read)?;
    let rev = s.rev_or_youngest(rev)?;
    let kind = s.fs.check_path(&Root::Revision(rev), &path).cmd_err()?;
    conn.write_success("w", &[Arg::Word(Some(kind.map_or("none", |k| k.as_str())))])
}

fn get_file(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c(?r)bb")?;
    let path = s.full_path(&t.req_cstring()?)?;
    let rev = inner(&mut t)?.rev()?;
    let want_props = t.bool()?;
    let want_contents = t.bool()?;
    s.require(AccessLevel::Read)?;
    let rev = s.rev_or_youngest(rev)?;
    let root = Root::Revision(rev);

    let dirent = s.fs.stat(&root, &path).cmd_err()?;
    if dirent.kind != NodeKind::File {
        return Err(FsError::NotFile(path)).cmd_err();
    }
    let props = if want_props {
        prop_items(&entry_props(&s.fs, &root, &path, &dirent)?)
    } else {
        Vec::new()
    };
    let contents = s.fs.file_contents(&root, &path).cmd_err()?;
    let checksum = hex::encode(Md5::digest(&contents));

    conn.write_success(
        "(?c)rl",
        &[Arg::CStr(Some(&checksum)), Arg::Rev(Some(rev)), Arg::List(&props)],
    )?;
    if want_contents {
        for chunk in contents.chunks(FILE_CHUNK) {
            conn.write_string(chunk);
        }
        conn.write_string(b"");
        conn.write_success("", &[])?;
    }
    Ok(())
}

fn get_dir(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c(?r)bb")?;
    let path = s.full_path(&t.req_cstring()?)?;
    let rev = inner(&mut t)?.rev()?;
    let want_props = t.bool()?;
    let want_contents = t.bool()?;
    s.require(AccessLevel::Read)?;
    let rev = s.rev_or_youngest(rev)?;
    let root = Root::Revision(rev);

    let dirent = s.fs.stat(&root, &path).cmd_err()?;
    if dirent.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory(path)).cmd_err();
    }
    let props = if want_props {
        prop_items(&entry_props(&s.fs, &root, &path, &dirent)?)
    } else {
        Vec::new()
    };
    let entries: Vec<Item> = if want_contents {
        s.fs.dir_list(&root, &path)
            .cmd_err()?
            .iter()
            .map(|(name, d)| dirent_item(name, d))
            .collect()
    } else {
        Vec::new()
    };
    conn.write_success("rll", &[Arg::Rev(Some(rev)), Arg::List(&props), Arg::List(&entries)])
}

struct LogRequest {
    paths: Vec<String>,
    start: Revnum,
    end: Revnum,
    changed_paths: bool,
}

fn write_log_entries(conn: &mut Conn, s: &Session, req: &LogRequest) -> Result<()> {
    let revs: Box<dyn Iterator<Item = Revnum>> = if req.start <= req.end {
        Box::new(req.start..=req.end)
    } else {
        Box::new((req.end..=req.start).rev())
    };
    for rev in revs {
        s.check_cancel()?;
        let changed = s.fs.paths_changed(&Root::Revision(rev))?;
        let touches = req
            .paths
            .iter()
            .any(|p| p == "/" || changed.keys().any(|c| c == p || is_below(c, p)));
        if !touches {
            continue;
        }
        let changes: Vec<Item> = if req.changed_paths {
            changed
                .values()
                .map(|c| Item::List(vec![Item::str(&c.path), Item::word(c.kind.action()), Item::List(Vec::new())]))
                .collect()
        } else {
            Vec::new()
        };
        let props = s.fs.revision_proplist(rev)?;
        let text = |name: &str| props.get(name).map(|v| Item::string(v.clone()));
        conn.write_item(&Item::List(vec![
            Item::List(changes),
            Item::Number(rev),
            optional(text(PROP_REVISION_AUTHOR)),
            optional(text(PROP_REVISION_DATE)),
            optional(text(PROP_REVISION_LOG)),
        ]));
    }
    Ok(())
}

fn log(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "l(?r)(?r)bb")?;
    let path_items = t.list()?;
    let start = inner(&mut t)?.rev()?;
    let end = inner(&mut t)?.rev()?;
    let changed_paths = t.bool()?;
    // Copies are not followed, so strict and non-strict history agree.
    let _strict = t.bool()?;
    s.require(AccessLevel::Read)?;

    let mut paths = Vec::new();
    for item in &path_items {
        match item {
            Item::String(p) => paths.push(s.full_path(&String::from_utf8_lossy(p))?),
            other => return Err(RaError::malformed(format!("log path is a {}", other.kind_name()))),
        }
    }
    if paths.is_empty() {
        paths.push(s.base_path.clone());
    }
    let req = LogRequest {
        paths,
        start: s.rev_or_youngest(start)?,
        end: s.rev_or_youngest(end)?,
        changed_paths,
    };

    let result = write_log_entries(conn, s, &req);
    conn.write_word("done");
    result.cmd_err()?;
    conn.write_success("", &[])
}

fn commit(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "clb")?;
    let message = t.req_cstring()?;
    let lock_items = t.list()?;
    let keep_locks = t.bool()?;
    s.require(AccessLevel::Write)?;

    let mut tokens = Vec::new();
    for item in &lock_items {
        let Item::List(fields) = item else {
            return Err(RaError::malformed("lock token entry is not a list"));
        };
        let mut entry = parse_tuple(fields, "cc")?;
        let path = s.full_path(&entry.req_cstring()?)?;
        tokens.push((path, entry.req_cstring()?));
    }
    let mut access = s.access_baton();
    for (_, token) in &tokens {
        access.add_token(token.clone());
    }

    let youngest = s.fs.youngest_rev().cmd_err()?;
    let txn = s.fs.begin_txn(youngest).cmd_err()?;
    let setup = s
        .fs
        .change_txn_prop(&txn, PROP_REVISION_LOG, Some(message.as_bytes()))
        .and_then(|()| match &s.user {
            Some(user) => s.fs.change_txn_prop(&txn, PROP_REVISION_AUTHOR, Some(user.as_bytes())),
            None => Ok(()),
        });
    if let Err(e) = setup {
        if let Err(abort) = s.fs.abort_txn(&txn) {
            warn!("could not abort transaction {}: {}", txn, abort);
        }
        return Err(e).cmd_err();
    }
    conn.write_success("", &[])?;

    let mut editor = CommitEditor::new(&s.fs, txn.clone(), &s.base_path, &s.repos_url, access.clone());
    let outcome = match drive_editor(conn, &mut editor) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(abort) = s.fs.abort_txn(&txn) {
                warn!("could not abort transaction {}: {}", txn, abort);
            }
            return Err(e);
        }
    };
    let info = match (outcome, editor.committed()) {
        (EditOutcome::Completed, Some(info)) => info.clone(),
        _ => {
            // The edit failed or was aborted, and the client has been told.
            if let Err(e) = s.fs.abort_txn(&txn) {
                debug!("transaction {} already gone: {}", txn, e);
            }
            return Ok(());
        }
    };

    if !keep_locks {
        for (path, token) in &tokens {
            if let Err(e) = s.fs.unlock(path, Some(token), &access, false) {
                debug!("could not release lock on {}: {}", path, e);
            }
        }
    }
    conn.write_success(
        "r(?c)(?c)",
        &[
            Arg::Rev(Some(info.rev)),
            Arg::CStr(info.date.as_deref()),
            Arg::CStr(info.author.as_deref()),
        ],
    )
}

/// Parameters shared by the report-driven commands
struct UpdateRequest {
    rev: Option<Revnum>,
    target: String,
    recurse: bool,
    switch_url: Option<String>,
    text_deltas: bool,
    ignore_ancestry: bool,
}

fn run_update(conn: &mut Conn, s: &Session, req: UpdateRequest) -> Result<()> {
    s.require(AccessLevel::Read)?;
    let target_rev = s.rev_or_youngest(req.rev)?;
    let switch_path = req.switch_url.as_deref().map(|u| s.url_to_path(u)).transpose()?;
    let report_root = s.full_path(&req.target)?;
    conn.write_success("", &[])?;

    let mut report = Report::new(&s.fs, &report_root, &s.repos_url);
    let Some(tree) = read_report(conn, &mut report)? else {
        return Ok(());
    };

    let entry = (!req.target.is_empty()).then(|| req.target.clone());
    let (target_anchor, entry_target) = match (switch_path, &entry) {
        (None, _) => (s.base_path.clone(), None),
        (Some(path), None) => (path, None),
        (Some(path), Some(_)) => (s.base_path.clone(), Some(path)),
    };
    let cancel = || s.check_cancel();
    let params = DeltaParams {
        fs: &s.fs,
        source: Root::Txn(tree.txn.clone()),
        source_anchor: s.base_path.clone(),
        target: Root::Revision(target_rev),
        target_anchor,
        entry,
        entry_target,
        recurse: req.recurse,
        text_deltas: req.text_deltas,
        ignore_ancestry: req.ignore_ancestry,
        cancel: &cancel,
    };
    let result = drive_tree_delta(&params, &mut WireEditor::new(conn), Some(target_rev), Some(tree.base_rev));
    if let Err(e) = s.fs.abort_txn(&tree.txn) {
        debug!("failed to abort report transaction {}: {}", tree.txn, e);
    }
    match result {
        // The client produced this failure and already knows about it.
        Err(e) if e.is_command_error() => {
            debug!("client rejected the edit: {}", e);
            Ok(())
        }
        other => other,
    }
}

fn checkout(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "(?r)b")?;
    let rev = inner(&mut t)?.rev()?;
    let recurse = t.bool()?;
    let req = UpdateRequest {
        rev,
        target: String::new(),
        recurse,
        switch_url: None,
        text_deltas: true,
        ignore_ancestry: false,
    };
    run_update(conn, s, req)
}

fn update(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "(?r)cb")?;
    let rev = inner(&mut t)?.rev()?;
    let target = t.req_cstring()?;
    let recurse = t.bool()?;
    let req = UpdateRequest {
        rev,
        target,
        recurse,
        switch_url: None,
        text_deltas: true,
        ignore_ancestry: false,
    };
    run_update(conn, s, req)
}

fn switch(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "(?r)cbc")?;
    let rev = inner(&mut t)?.rev()?;
    let target = t.req_cstring()?;
    let recurse = t.bool()?;
    let url = t.req_cstring()?;
    let req = UpdateRequest {
        rev,
        target,
        recurse,
        switch_url: Some(url),
        text_deltas: true,
        ignore_ancestry: false,
    };
    run_update(conn, s, req)
}

fn status(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "cb")?;
    let target = t.req_cstring()?;
    let recurse = t.bool()?;
    let req = UpdateRequest {
        rev: None,
        target,
        recurse,
        switch_url: None,
        text_deltas: false,
        ignore_ancestry: false,
    };
    run_update(conn, s, req)
}

fn diff(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "(?r)cbbc")?;
    let rev = inner(&mut t)?.rev()?;
    let target = t.req_cstring()?;
    let recurse = t.bool()?;
    let ignore_ancestry = t.bool()?;
    let url = t.req_cstring()?;
    let req = UpdateRequest {
        rev,
        target,
        recurse,
        switch_url: Some(url),
        text_deltas: true,
        ignore_ancestry,
    };
    run_update(conn, s, req)
}

fn lock(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c(?c)b")?;
    let path = s.full_path(&t.req_cstring()?)?;
    let comment = inner(&mut t)?.cstring()?;
    let steal = t.bool()?;
    s.require(AccessLevel::Write)?;
    let lock = s
        .fs
        .lock(&path, &s.access_baton(), comment.as_deref(), None, steal)
        .cmd_err()?;
    conn.write_success("l", &[Arg::List(&[lock_item(&lock)])])
}

fn unlock(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c(?c)b")?;
    let path = s.full_path(&t.req_cstring()?)?;
    let token = inner(&mut t)?.cstring()?;
    let break_lock = t.bool()?;
    s.require(AccessLevel::Write)?;
    s.fs
        .unlock(&path, token.as_deref(), &s.access_baton(), break_lock)
        .cmd_err()?;
    conn.write_success("", &[])
}

fn get_lock(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c")?;
    let path = s.full_path(&t.req_cstring()?)?;
    s.require(AccessLevel::Read)?;
    let lock = s.fs.get_lock(&path).cmd_err()?;
    let items: Vec<Item> = lock.iter().map(lock_item).collect();
    conn.write_success("l", &[Arg::List(&items)])
}

fn get_locks(conn: &mut Conn, params: &[Item], s: &mut Session) -> Result<()> {
    let mut t = parse_tuple(params, "c")?;
    let path = s.full_path(&t.req_cstring()?)?;
    s.require(AccessLevel::Read)?;
    let locks = s.fs.get_locks(&path).cmd_err()?;
    let items: Vec<Item> = locks.iter().map(lock_item).collect();
    conn.write_success("l", &[Arg::List(&items)])
}

const COMMANDS: &[CommandEntry<Session>] = &[
    CommandEntry::new("get-latest-rev", get_latest_rev),
    CommandEntry::new("get-dated-rev", get_dated_rev),
    CommandEntry::new("change-rev-prop", change_rev_prop),
    CommandEntry::new("rev-proplist", rev_proplist),
    CommandEntry::new("rev-prop", rev_prop),
    CommandEntry::new("check-path", check_path),
    CommandEntry::new("get-file", get_file),
    CommandEntry::new("get-dir", get_dir),
    CommandEntry::new("log", log),
    CommandEntry::new("commit", commit),
    CommandEntry::new("checkout", checkout),
    CommandEntry::new("update", update),
    CommandEntry::new("switch", switch),
    CommandEntry::new("status", status),
    CommandEntry::new("diff", diff),
    CommandEntry::new("lock", lock),
    CommandEntry::new("unlock", unlock),
    CommandEntry::new("get-lock", get_lock),
    CommandEntry::new("get-locks", get_locks),
];
