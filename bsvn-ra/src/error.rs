//! Wire-level errors
//!
//! Two tiers: a [`RaError::Command`] is reported to the peer as a `failure`
//! response and the connection carries on; every other variant ends the
//! command loop.

use bsvn_core::FsError;
use std::fmt;
use std::panic::Location;

pub mod codes {
    pub const RA_NOT_AUTHORIZED: u64 = 170001;
    pub const RA_SVN_CMD_ERR: u64 = 210000;
    pub const RA_SVN_UNKNOWN_CMD: u64 = 210001;
    pub const RA_SVN_CONNECTION_CLOSED: u64 = 210002;
    pub const RA_SVN_IO_ERROR: u64 = 210003;
    pub const RA_SVN_MALFORMED_DATA: u64 = 210004;
    pub const RA_SVN_REPOS_NOT_FOUND: u64 = 210005;
    pub const RA_SVN_BAD_VERSION: u64 = 210006;
    pub const ASSERTION_FAIL: u64 = 235000;
}

/// One link of an error chain as it travels over the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorItem {
    pub code: u64,
    pub message: String,
    pub file: String,
    pub line: u64,
}

/// An error and its causes, outermost first and root cause last
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorChain {
    pub items: Vec<ErrorItem>,
}

impl ErrorChain {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            items: vec![ErrorItem {
                code,
                message: message.into(),
                file: String::new(),
                line: 0,
            }],
        }
    }

    /// Chain for `err` and its `source()` causes, tagged with `location`
    pub fn from_error(code: u64, err: &(dyn std::error::Error + 'static), location: &Location<'_>) -> Self {
        let mut items = vec![ErrorItem {
            code,
            message: err.to_string(),
            file: location.file().to_string(),
            line: u64::from(location.line()),
        }];
        let mut cause = err.source();
        while let Some(e) = cause {
            items.push(ErrorItem {
                code,
                message: e.to_string(),
                file: String::new(),
                line: 0,
            });
            cause = e.source();
        }
        Self { items }
    }

    /// Put `item` in front as the new outermost error
    pub fn wrap(mut self, item: ErrorItem) -> Self {
        self.items.insert(0, item);
        self
    }

    /// Code of the outermost error
    pub fn code(&self) -> u64 {
        self.items.first().map_or(codes::RA_SVN_CMD_ERR, |i| i.code)
    }

    pub fn root_cause(&self) -> Option<&ErrorItem> {
        self.items.last()
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for item in &self.items {
            if !first {
                f.write_str(": ")?;
            }
            first = false;
            f.write_str(&item.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaError {
    #[error("Malformed network data: {0}")]
    MalformedData(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error to send back to the peer as a `failure` response
    #[error("{0}")]
    Command(ErrorChain),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Invalid tuple format '{0}'")]
    InvalidFormat(String),

    #[error("Authorization failed: {0}")]
    NotAuthorized(String),

    #[error("No repository found at '{0}'")]
    ReposNotFound(String),

    #[error("Unsupported protocol version {0}")]
    BadVersion(u64),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, RaError>;

impl RaError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        RaError::MalformedData(detail.into())
    }

    pub fn code(&self) -> u64 {
        match self {
            RaError::MalformedData(_) => codes::RA_SVN_MALFORMED_DATA,
            RaError::ConnectionClosed => codes::RA_SVN_CONNECTION_CLOSED,
            RaError::Io(_) => codes::RA_SVN_IO_ERROR,
            RaError::Command(chain) => chain.code(),
            RaError::UnknownCommand(_) => codes::RA_SVN_UNKNOWN_CMD,
            RaError::InvalidFormat(_) => codes::ASSERTION_FAIL,
            RaError::NotAuthorized(_) => codes::RA_NOT_AUTHORIZED,
            RaError::ReposNotFound(_) => codes::RA_SVN_REPOS_NOT_FOUND,
            RaError::BadVersion(_) => codes::RA_SVN_BAD_VERSION,
            RaError::Fs(e) => e.code(),
        }
    }

    pub fn is_command_error(&self) -> bool {
        matches!(self, RaError::Command(_))
    }

    /// Turn any error into a command error raised at `location`
    pub fn into_command(self, location: &Location<'_>) -> Self {
        match self {
            RaError::Command(_) => self,
            RaError::Fs(e) => RaError::Command(ErrorChain::from_error(e.code(), &e, location)),
            other => {
                let code = other.code();
                RaError::Command(ErrorChain::from_error(code, &other, location))
            }
        }
    }

    /// The chain to report for this error
    pub fn to_chain(&self) -> ErrorChain {
        match self {
            RaError::Command(chain) => chain.clone(),
            other => ErrorChain::new(other.code(), other.to_string()),
        }
    }
}

/// Mark a failure as reportable to the peer
pub trait CommandResultExt<T> {
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Into<RaError>> CommandResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn cmd_err(self) -> Result<T> {
        let location = Location::caller();
        self.map_err(|e| e.into().into_command(location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_err_records_location_and_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let result: std::result::Result<(), FsError> = Err(FsError::Io(io));
        let err = result.cmd_err().unwrap_err();
        let RaError::Command(chain) = err else {
            panic!("expected a command error");
        };
        assert_eq!(chain.items[0].file, file!());
        assert!(chain.items[0].line > 0);
        assert_eq!(chain.root_cause().unwrap().message, "disk on fire");
    }

    #[test]
    fn test_command_errors_pass_through() {
        let chain = ErrorChain::new(160013, "File not found");
        let err = RaError::Command(chain.clone()).into_command(Location::caller());
        assert!(matches!(err, RaError::Command(c) if c == chain));
        assert_eq!(RaError::ConnectionClosed.code(), codes::RA_SVN_CONNECTION_CLOSED);
    }

    #[test]
    fn test_chain_display_outermost_first() {
        let chain = ErrorChain::new(1, "root").wrap(ErrorItem {
            code: 2,
            message: "outer".into(),
            file: String::new(),
            line: 0,
        });
        assert_eq!(chain.to_string(), "outer: root");
        assert_eq!(chain.code(), 2);
    }
}
