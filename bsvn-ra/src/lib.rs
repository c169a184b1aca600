//! BSvn RA Library
//!
//! The svn wire protocol as both ends speak it:
//! - Item and tuple codec over a buffered connection
//! - Error chains and the command/fatal error split
//! - Command dispatch tables
//! - The tree editor capability set, carried over the wire in both directions

pub mod delta;
pub mod dispatch;
pub mod editor;
pub mod error;
pub mod marshal;

pub use delta::{Editor, send_contents};
pub use dispatch::{CommandEntry, CommandHandler, handle_commands};
pub use editor::{EditOutcome, WireEditor, WireFile, drive_editor};
pub use error::{CommandResultExt, ErrorChain, ErrorItem, RaError, Result, codes};
pub use marshal::{Arg, Conn, Item, Tuple, Value, parse_tuple, validate_format};
