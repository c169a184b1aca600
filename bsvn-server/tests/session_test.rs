//! Whole sessions against a served repository over loopback TCP

use bsvn_core::svndiff::{self, TxDeltaWindow};
use bsvn_core::{Filesystem, Revnum};
use bsvn_ra::{Arg, Conn, EditOutcome, Editor, Item, RaError, Result, WireEditor, drive_editor, send_contents};
use bsvn_server::auth::cram_md5_response;
use bsvn_server::{AccessLevel, ServeConfig, ServeContext, serve_connection};
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use tempfile::TempDir;

struct Server {
    url: String,
    _dir: TempDir,
    handle: JoinHandle<Result<()>>,
    addr: std::net::SocketAddr,
}

fn start_server(config: ServeConfig) -> Server {
    let dir = TempDir::new().unwrap();
    Filesystem::create(&dir.path().join("repo")).unwrap();
    let ctx = ServeContext::new(dir.path(), config);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut conn = Conn::from_tcp(stream)?;
        serve_connection(&mut conn, &ctx)
    });
    Server {
        url: format!("svn://{}/repo", addr),
        _dir: dir,
        handle,
        addr,
    }
}

fn writable() -> ServeConfig {
    let mut config = ServeConfig::default();
    config.general.anon_access = AccessLevel::Write;
    config
}

/// Greeting and mechanism list
fn connect(server: &Server) -> (Conn, Vec<String>) {
    let mut conn = Conn::from_tcp(TcpStream::connect(server.addr).unwrap()).unwrap();
    let mut greeting = conn.read_response("nnll").unwrap();
    assert_eq!(greeting.number().unwrap(), 1);
    assert_eq!(greeting.number().unwrap(), 2);
    let mechs = greeting
        .list()
        .unwrap()
        .into_iter()
        .map(|m| match m {
            Item::Word(w) => w,
            other => panic!("mechanism is a {}", other.kind_name()),
        })
        .collect();
    (conn, mechs)
}

fn send_client_greeting(conn: &mut Conn, mech: &str) {
    conn.start_list();
    conn.write_tuple("nw(?s)l", &[Arg::Number(2), Arg::Word(Some(mech)), Arg::Str(None), Arg::List(&[])])
        .unwrap();
    conn.end_list();
}

fn send_url(conn: &mut Conn, url: &str) -> Result<(String, String)> {
    conn.start_list();
    conn.write_cstring(url);
    conn.end_list();
    let mut t = conn.read_response("cc")?;
    Ok((t.req_cstring()?, t.req_cstring()?))
}

fn open_anonymous(server: &Server) -> Conn {
    let (mut conn, mechs) = connect(server);
    assert!(mechs.contains(&"ANONYMOUS".to_string()));
    send_client_greeting(&mut conn, "ANONYMOUS");
    conn.read_response("").unwrap();
    let (root_url, _uuid) = send_url(&mut conn, &server.url).unwrap();
    assert_eq!(root_url, server.url);
    conn
}

fn commit_file(conn: &mut Conn, path: &str, text: &[u8]) -> Result<Revnum> {
    conn.write_command("commit", "clb", &[Arg::CStr(Some("add a file")), Arg::List(&[]), Arg::Bool(false)])?;
    conn.read_response("")?;
    {
        let mut editor = WireEditor::new(conn);
        let mut root = editor.open_root(None)?;
        let mut file = editor.add_file(path, &mut root, None)?;
        send_contents(&mut editor, &mut file, None, &svndiff::fulltext_windows(text, 1024))?;
        editor.close_file(file, None)?;
        editor.close_directory(root)?;
        editor.close_edit()?;
    }
    let mut info = conn.read_response("r(?c)(?c)")?;
    info.rev()?.ok_or_else(|| RaError::malformed("no revision"))
}

#[derive(Default)]
struct Checkout {
    calls: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    windows: Vec<TxDeltaWindow>,
}

impl Editor for Checkout {
    type Dir = ();
    type File = String;

    fn set_target_revision(&mut self, rev: Revnum) -> Result<()> {
        self.calls.push(format!("target-rev {}", rev));
        Ok(())
    }
    fn open_root(&mut self, _base_rev: Option<Revnum>) -> Result<()> {
        self.calls.push("open-root".into());
        Ok(())
    }
    fn delete_entry(&mut self, path: &str, _rev: Option<Revnum>, _parent: &mut ()) -> Result<()> {
        self.calls.push(format!("delete-entry {}", path));
        Ok(())
    }
    fn add_directory(&mut self, path: &str, _parent: &mut (), _copyfrom: Option<(&str, Revnum)>) -> Result<()> {
        self.calls.push(format!("add-dir {}", path));
        Ok(())
    }
    fn open_directory(&mut self, path: &str, _parent: &mut (), _base_rev: Option<Revnum>) -> Result<()> {
        self.calls.push(format!("open-dir {}", path));
        Ok(())
    }
    fn change_dir_prop(&mut self, _dir: &mut (), _name: &str, _value: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
    fn close_directory(&mut self, _dir: ()) -> Result<()> {
        Ok(())
    }
    fn add_file(&mut self, path: &str, _parent: &mut (), _copyfrom: Option<(&str, Revnum)>) -> Result<String> {
        self.calls.push(format!("add-file {}", path));
        Ok(path.to_string())
    }
    fn open_file(&mut self, path: &str, _parent: &mut (), _base_rev: Option<Revnum>) -> Result<String> {
        self.calls.push(format!("open-file {}", path));
        Ok(path.to_string())
    }
    fn apply_textdelta(&mut self, _file: &mut String, _base: Option<&str>) -> Result<bool> {
        self.windows.clear();
        Ok(true)
    }
    fn textdelta_window(&mut self, file: &mut String, window: Option<&TxDeltaWindow>) -> Result<()> {
        match window {
            Some(w) => self.windows.push(w.clone()),
            None => {
                let base = self.files.get(file.as_str()).cloned().unwrap_or_default();
                let text = svndiff::apply(&base, &self.windows)?;
                self.files.insert(file.clone(), text);
            }
        }
        Ok(())
    }
    fn change_file_prop(&mut self, _file: &mut String, _name: &str, _value: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
    fn close_file(&mut self, _file: String, _checksum: Option<&str>) -> Result<()> {
        Ok(())
    }
    fn close_edit(&mut self) -> Result<()> {
        self.calls.push("close-edit".into());
        Ok(())
    }
    fn abort_edit(&mut self) -> Result<()> {
        self.calls.push("abort-edit".into());
        Ok(())
    }
}

fn hang_up(server: Server, conn: Conn) {
    drop(conn);
    server.handle.join().unwrap().unwrap();
}

#[test]
fn test_commit_then_read_back() {
    let server = start_server(writable());
    let mut conn = open_anonymous(&server);

    assert_eq!(commit_file(&mut conn, "iota", b"hello").unwrap(), 1);

    conn.write_command("get-latest-rev", "", &[]).unwrap();
    assert_eq!(conn.read_response("r").unwrap().rev().unwrap(), Some(1));

    conn.write_command("check-path", "c(?r)", &[Arg::CStr(Some("iota")), Arg::Rev(None)])
        .unwrap();
    assert_eq!(conn.read_response("w").unwrap().req_word().unwrap(), "file");

    conn.write_command(
        "get-file",
        "c(?r)bb",
        &[Arg::CStr(Some("iota")), Arg::Rev(Some(1)), Arg::Bool(true), Arg::Bool(true)],
    )
    .unwrap();
    let mut head = conn.read_response("(?c)rl").unwrap();
    let checksum = head.tuple().unwrap().unwrap().cstring().unwrap();
    assert_eq!(checksum.unwrap(), hex::encode(Md5::digest(b"hello")));
    assert_eq!(head.rev().unwrap(), Some(1));
    let mut contents = Vec::new();
    loop {
        match conn.read_item().unwrap() {
            Item::String(s) if s.is_empty() => break,
            Item::String(s) => contents.extend_from_slice(&s),
            other => panic!("unexpected {}", other.kind_name()),
        }
    }
    conn.read_response("").unwrap();
    assert_eq!(contents, b"hello");

    conn.write_command(
        "get-dir",
        "c(?r)bb",
        &[Arg::CStr(Some("")), Arg::Rev(None), Arg::Bool(false), Arg::Bool(true)],
    )
    .unwrap();
    let mut dir = conn.read_response("rll").unwrap();
    assert_eq!(dir.rev().unwrap(), Some(1));
    let _props = dir.list().unwrap();
    let entries = dir.list().unwrap();
    assert_eq!(entries.len(), 1);
    let Item::List(fields) = &entries[0] else {
        panic!("dirent is not a list");
    };
    let mut dirent = bsvn_ra::parse_tuple(fields, "cwnbr(?c)(?c)").unwrap();
    assert_eq!(dirent.req_cstring().unwrap(), "iota");
    assert_eq!(dirent.req_word().unwrap(), "file");
    assert_eq!(dirent.number().unwrap(), 5);

    hang_up(server, conn);
}

#[test]
fn test_log_lists_revisions() {
    let server = start_server(writable());
    let mut conn = open_anonymous(&server);
    commit_file(&mut conn, "iota", b"one").unwrap();
    commit_file(&mut conn, "kappa", b"two").unwrap();

    conn.write_command(
        "log",
        "l(?r)(?r)bb",
        &[Arg::List(&[]), Arg::Rev(Some(2)), Arg::Rev(Some(1)), Arg::Bool(true), Arg::Bool(false)],
    )
    .unwrap();
    let mut revs = Vec::new();
    loop {
        match conn.read_item().unwrap() {
            Item::Word(w) if w == "done" => break,
            Item::List(entry) => {
                let mut t = bsvn_ra::parse_tuple(&entry, "lr(?s)(?s)(?s)").unwrap();
                let changed = t.list().unwrap();
                assert!(!changed.is_empty());
                revs.push(t.rev().unwrap().unwrap());
                t.tuple().unwrap();
                t.tuple().unwrap();
                let message = t.tuple().unwrap().unwrap().string().unwrap().unwrap();
                assert_eq!(&message[..], b"add a file");
            }
            other => panic!("unexpected {}", other.kind_name()),
        }
    }
    conn.read_response("").unwrap();
    assert_eq!(revs, vec![2, 1]);

    hang_up(server, conn);
}

#[test]
fn test_checkout_drives_client_editor() {
    let server = start_server(writable());
    let mut conn = open_anonymous(&server);
    commit_file(&mut conn, "iota", b"This is the file 'iota'.\n").unwrap();

    conn.write_command("checkout", "(?r)b", &[Arg::Rev(None), Arg::Bool(true)]).unwrap();
    conn.read_response("").unwrap();
    conn.write_command("set-path", "crb", &[Arg::CStr(Some("")), Arg::Rev(Some(1)), Arg::Bool(true)])
        .unwrap();
    conn.write_command("finish-report", "", &[]).unwrap();
    conn.read_response("").unwrap();

    let mut checkout = Checkout::default();
    assert_eq!(drive_editor(&mut conn, &mut checkout).unwrap(), EditOutcome::Completed);
    assert_eq!(checkout.calls, vec!["target-rev 1", "open-root", "add-file iota", "close-edit"]);
    assert_eq!(checkout.files["iota"], b"This is the file 'iota'.\n");

    // The scratch transaction is gone and the session is still usable.
    conn.write_command("get-latest-rev", "", &[]).unwrap();
    assert_eq!(conn.read_response("r").unwrap().rev().unwrap(), Some(1));
    hang_up(server, conn);
}

#[test]
fn test_read_only_session_cannot_commit() {
    let server = start_server(ServeConfig::default());
    let mut conn = open_anonymous(&server);

    conn.write_command("commit", "clb", &[Arg::CStr(Some("nope")), Arg::List(&[]), Arg::Bool(false)])
        .unwrap();
    match conn.read_response("") {
        Err(RaError::Command(chain)) => assert_eq!(chain.code(), bsvn_ra::codes::RA_NOT_AUTHORIZED),
        other => panic!("expected a command failure, got {:?}", other.map(|_| ())),
    }

    // A failed command leaves the connection open.
    conn.write_command("get-latest-rev", "", &[]).unwrap();
    assert_eq!(conn.read_response("r").unwrap().rev().unwrap(), Some(0));
    hang_up(server, conn);
}

#[test]
fn test_lock_blocks_other_committers() {
    let server = start_server(writable());
    let mut conn = open_anonymous(&server);
    commit_file(&mut conn, "iota", b"hello").unwrap();

    // Anonymous users cannot hold locks.
    conn.write_command("lock", "c(?c)b", &[Arg::CStr(Some("iota")), Arg::CStr(None), Arg::Bool(false)])
        .unwrap();
    assert!(matches!(conn.read_response("l"), Err(RaError::Command(_))));

    conn.write_command("get-locks", "c", &[Arg::CStr(Some(""))]).unwrap();
    assert!(conn.read_response("l").unwrap().list().unwrap().is_empty());
    hang_up(server, conn);
}

fn cram_config() -> ServeConfig {
    let mut config = ServeConfig::default();
    config.general.anon_access = AccessLevel::None;
    config.users.insert("harry".into(), "harryssecret".into());
    config
}

fn cram_login(server: &Server, password: &str) -> (Conn, Result<()>) {
    let (mut conn, mechs) = connect(server);
    assert_eq!(mechs, vec!["CRAM-MD5"]);
    send_client_greeting(&mut conn, "CRAM-MD5");
    let challenge = match conn.read_item().unwrap() {
        Item::List(items) => match &items[..] {
            [Item::Word(w), Item::List(args)] if w == "step" => match &args[..] {
                [Item::String(c)] => c.clone(),
                _ => panic!("bad step arguments"),
            },
            _ => panic!("expected a step"),
        },
        other => panic!("unexpected {}", other.kind_name()),
    };
    conn.write_string(cram_md5_response("harry", password, &challenge).unwrap().as_bytes());
    let result = conn.read_response("").map(|_| ());
    (conn, result)
}

#[test]
fn test_cram_md5_login_and_author() {
    let server = start_server(cram_config());
    let (mut conn, result) = cram_login(&server, "harryssecret");
    result.unwrap();
    send_url(&mut conn, &format!("{}/", server.url)).unwrap();

    commit_file(&mut conn, "iota", b"hello").unwrap();
    conn.write_command("rev-prop", "rc", &[Arg::Rev(Some(1)), Arg::CStr(Some("svn:author"))])
        .unwrap();
    let author = conn.read_response("(?s)").unwrap().tuple().unwrap().unwrap().string().unwrap().unwrap();
    assert_eq!(&author[..], b"harry");

    conn.write_command("lock", "c(?c)b", &[Arg::CStr(Some("iota")), Arg::CStr(Some("mine")), Arg::Bool(false)])
        .unwrap();
    let locks = conn.read_response("l").unwrap().list().unwrap();
    let Item::List(fields) = &locks[0] else {
        panic!("lock is not a list");
    };
    let mut lock = bsvn_ra::parse_tuple(fields, "ccc(?c)c(?c)").unwrap();
    assert_eq!(lock.req_cstring().unwrap(), "/iota");
    assert!(lock.req_cstring().unwrap().starts_with("opaquelocktoken:"));
    assert_eq!(lock.req_cstring().unwrap(), "harry");
    hang_up(server, conn);
}

#[test]
fn test_cram_md5_wrong_password() {
    let server = start_server(cram_config());
    let (_conn, result) = cram_login(&server, "guess");
    match result {
        Err(RaError::Command(chain)) => assert_eq!(chain.code(), bsvn_ra::codes::RA_NOT_AUTHORIZED),
        other => panic!("expected an auth failure, got {:?}", other),
    }
    assert!(matches!(server.handle.join().unwrap(), Err(RaError::NotAuthorized(_))));
}

#[test]
fn test_unknown_repository() {
    let server = start_server(writable());
    let (mut conn, _) = connect(&server);
    send_client_greeting(&mut conn, "ANONYMOUS");
    conn.read_response("").unwrap();
    let err = send_url(&mut conn, &format!("svn://{}/elsewhere", server.addr)).unwrap_err();
    assert!(matches!(err, RaError::Command(c) if c.code() == bsvn_ra::codes::RA_SVN_REPOS_NOT_FOUND));
    assert!(server.handle.join().unwrap().is_err());
}
