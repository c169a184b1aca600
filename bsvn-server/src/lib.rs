//! BSvn Server Library
//!
//! Everything behind the `bsvnserve` binary:
//! - Server configuration and CRAM-MD5 authentication
//! - The session handshake and command table
//! - The working-copy report mirrored into a scratch transaction
//! - A filesystem-backed commit editor
//! - The tree-delta walk that drives update, switch, status and diff

pub mod auth;
pub mod commit_editor;
pub mod config;
pub mod reporter;
pub mod serve;
pub mod tree_delta;

pub use commit_editor::{CommitEditor, CommitInfo};
pub use config::{AccessLevel, ServeConfig};
pub use serve::{ServeContext, Session, handshake, serve_connection};
