//! Command dispatch loop

use crate::error::{ErrorChain, RaError, Result};
use crate::marshal::{Conn, Item};
use tracing::debug;

/// Handles one command's parameters and writes its response
pub type CommandHandler<B> = fn(&mut Conn, &[Item], &mut B) -> Result<()>;

pub struct CommandEntry<B> {
    pub name: &'static str,
    pub handler: CommandHandler<B>,
    /// End the loop once this command has been handled
    pub terminate: bool,
}

impl<B> CommandEntry<B> {
    pub const fn new(name: &'static str, handler: CommandHandler<B>) -> Self {
        Self {
            name,
            handler,
            terminate: false,
        }
    }

    pub const fn terminating(name: &'static str, handler: CommandHandler<B>) -> Self {
        Self {
            name,
            handler,
            terminate: true,
        }
    }
}

/// Read and dispatch commands until a terminating command has run.
///
/// Command errors are written back as `failure` responses and the loop
/// goes on, unless `pass_through_errors` is set, in which case they are
/// returned. Any other error ends the loop and is returned.
pub fn handle_commands<B>(
    conn: &mut Conn,
    commands: &[CommandEntry<B>],
    baton: &mut B,
    pass_through_errors: bool,
) -> Result<()> {
    loop {
        let (name, params) = conn.read_command()?;
        let entry = commands.iter().find(|e| e.name == name);
        debug!("dispatching command {}", name);
        let result = match entry {
            Some(e) => (e.handler)(conn, &params, baton),
            None => {
                let err = RaError::UnknownCommand(name.clone());
                Err(RaError::Command(ErrorChain::new(err.code(), err.to_string())))
            }
        };
        match result {
            Ok(()) => {}
            Err(RaError::Command(chain)) if !pass_through_errors => {
                debug!("command {} failed: {}", name, chain);
                conn.write_failure(&chain);
            }
            Err(e) => return Err(e),
        }
        if entry.is_some_and(|e| e.terminate) {
            break;
        }
    }
    conn.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandResultExt;
    use crate::marshal::Arg;
    use bsvn_core::FsError;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counter {
        calls: Vec<&'static str>,
    }

    fn ping(conn: &mut Conn, _: &[Item], b: &mut Counter) -> Result<()> {
        b.calls.push("ping");
        conn.write_success("w", &[Arg::Word(Some("pong"))])
    }

    fn fail(_: &mut Conn, _: &[Item], b: &mut Counter) -> Result<()> {
        b.calls.push("fail");
        Err(FsError::NotFound("/nope".into())).cmd_err()
    }

    fn fatal(_: &mut Conn, _: &[Item], b: &mut Counter) -> Result<()> {
        b.calls.push("fatal");
        Err(RaError::Io(std::io::Error::other("socket gone")))
    }

    fn quit(conn: &mut Conn, _: &[Item], b: &mut Counter) -> Result<()> {
        b.calls.push("quit");
        conn.write_success("", &[])
    }

    const COMMANDS: &[CommandEntry<Counter>] = &[
        CommandEntry::new("ping", ping),
        CommandEntry::new("fail", fail),
        CommandEntry::new("fatal", fatal),
        CommandEntry::terminating("quit", quit),
    ];

    fn run(input: &str, pass_through: bool) -> (Result<()>, Counter, String) {
        let out = Shared::default();
        let mut conn = Conn::new(Box::new(Cursor::new(input.as_bytes().to_vec())), Box::new(out.clone()));
        let mut counter = Counter::default();
        let result = handle_commands(&mut conn, COMMANDS, &mut counter, pass_through);
        let written = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        (result, counter, written)
    }

    #[test]
    fn test_command_error_keeps_connection() {
        let (result, counter, written) = run("( fail ( ) ) ( ping ( ) ) ( quit ( ) ) ( ping ( ) ) ", false);
        assert!(result.is_ok());
        assert_eq!(counter.calls, vec!["fail", "ping", "quit"]);
        assert!(written.starts_with("( failure ( ( 160013 "));
        assert!(written.contains("( success ( pong ) ) "));
        assert!(written.ends_with("( success ( ) ) "));
    }

    #[test]
    fn test_fatal_error_ends_loop() {
        let (result, counter, _) = run("( fatal ( ) ) ( ping ( ) ) ", false);
        assert!(matches!(result, Err(RaError::Io(_))));
        assert_eq!(counter.calls, vec!["fatal"]);
    }

    #[test]
    fn test_pass_through_errors() {
        let (result, counter, written) = run("( fail ( ) ) ( ping ( ) ) ", true);
        assert!(matches!(result, Err(RaError::Command(_))));
        assert_eq!(counter.calls, vec!["fail"]);
        assert!(written.is_empty());
    }

    #[test]
    fn test_unknown_command_is_reported() {
        let (result, counter, written) = run("( bogus ( ) ) ( quit ( ) ) ", false);
        assert!(result.is_ok());
        assert_eq!(counter.calls, vec!["quit"]);
        assert!(written.contains("Unknown command 'bogus'"));
    }

    #[test]
    fn test_hang_up_is_connection_closed() {
        let (result, _, _) = run("( ping ( ) ) ", false);
        assert!(matches!(result, Err(RaError::ConnectionClosed)));
    }
}
