//! Error taxonomy for the filesystem layers
//!
//! Every variant maps onto a Subversion-compatible numeric code so that the
//! protocol layer can put it on the wire unchanged.

use crate::Revnum;

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur in the filesystem layers
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Malformed {kind} skel")]
    MalformedSkel { kind: &'static str },

    #[error("Corrupt node revision for node '{id}' in filesystem '{fs_path}'")]
    CorruptNodeRevision { id: String, fs_path: String },

    #[error("Reference to non-existent node '{id}' in filesystem '{fs_path}'")]
    DanglingId { id: String, fs_path: String },

    #[error("'{0}' is not a node revision ID")]
    NotNodeRevisionId(String),

    #[error("Corrupt revision {rev} in filesystem '{fs_path}': {detail}")]
    CorruptRevision {
        rev: Revnum,
        fs_path: String,
        detail: String,
    },

    #[error("Corrupt representation '{key}': {detail}")]
    CorruptRepresentation { key: String, detail: String },

    #[error("Corrupt clone record for '{key}': {detail}")]
    CloneConflict { key: String, detail: String },

    #[error("Attempted to modify immutable node '{0}'")]
    NotMutable(String),

    #[error("Attempted to modify immutable representation '{0}'")]
    RepNotMutable(String),

    #[error("No such revision {0}")]
    NoSuchRevision(Revnum),

    #[error("No transaction named '{0}'")]
    NoSuchTransaction(String),

    #[error("No such representation '{0}'")]
    NoSuchRepresentation(String),

    #[error("No such string '{0}'")]
    NoSuchString(String),

    #[error("No such copy '{0}'")]
    NoSuchCopy(String),

    #[error("Path '{0}' not found")]
    NotFound(String),

    #[error("Path '{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' is not a directory")]
    NotDirectory(String),

    #[error("'{0}' is not a file")]
    NotFile(String),

    #[error("The root directory cannot be deleted or replaced")]
    RootDir,

    #[error("Invalid path '{0}'")]
    PathSyntax(String),

    #[error("Conflict at '{0}'")]
    Conflict(String),

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Path '{path}' is already locked by user '{owner}'")]
    PathAlreadyLocked { path: String, owner: String },

    #[error("No lock on path '{0}'")]
    NoSuchLock(String),

    #[error("Cannot verify lock on path '{path}'; no matching lock-token available")]
    BadLockToken { path: String },

    #[error("User '{user}' does not own lock on path '{path}' (currently locked by '{owner}')")]
    LockOwnerMismatch {
        user: String,
        path: String,
        owner: String,
    },

    #[error("Cannot lock path '{0}' without a username")]
    NoUser(String),

    #[error("Invalid date '{0}'")]
    BadDate(String),

    #[error("svndiff data error: {0}")]
    Svndiff(String),

    #[error("Retryable conflict in storage engine: {0}")]
    Retryable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Numeric codes shared with the Subversion error space
pub mod codes {
    pub const FS_GENERAL: u64 = 160000;
    pub const FS_CORRUPT: u64 = 160004;
    pub const FS_PATH_SYNTAX: u64 = 160005;
    pub const FS_NO_SUCH_REVISION: u64 = 160006;
    pub const FS_NO_SUCH_TRANSACTION: u64 = 160007;
    pub const FS_NO_SUCH_REPRESENTATION: u64 = 160009;
    pub const FS_NO_SUCH_STRING: u64 = 160010;
    pub const FS_NO_SUCH_COPY: u64 = 160011;
    pub const FS_NOT_FOUND: u64 = 160013;
    pub const FS_ID_NOT_FOUND: u64 = 160014;
    pub const FS_NOT_ID: u64 = 160015;
    pub const FS_NOT_DIRECTORY: u64 = 160016;
    pub const FS_NOT_FILE: u64 = 160017;
    pub const FS_NOT_MUTABLE: u64 = 160019;
    pub const FS_ALREADY_EXISTS: u64 = 160020;
    pub const FS_ROOT_DIR: u64 = 160021;
    pub const FS_CONFLICT: u64 = 160024;
    pub const FS_REP_NOT_MUTABLE: u64 = 160026;
    pub const FS_MALFORMED_SKEL: u64 = 160027;
    pub const FS_DB_ERROR: u64 = 160029;
    pub const FS_DB_DEADLOCK: u64 = 160030;
    pub const FS_NO_USER: u64 = 160034;
    pub const FS_PATH_ALREADY_LOCKED: u64 = 160035;
    pub const FS_BAD_LOCK_TOKEN: u64 = 160037;
    pub const FS_LOCK_OWNER_MISMATCH: u64 = 160039;
    pub const FS_NO_SUCH_LOCK: u64 = 160040;
    pub const CHECKSUM_MISMATCH: u64 = 200014;
    pub const BAD_DATE: u64 = 125003;
    pub const SVNDIFF_CORRUPT_WINDOW: u64 = 185001;
    pub const IO_ERROR: u64 = 70014;
    pub const BAD_CONFIG: u64 = 205000;
    pub const CANCELLED: u64 = 200015;
}

impl FsError {
    /// Subversion-compatible numeric error code
    pub fn code(&self) -> u64 {
        use codes::*;
        match self {
            FsError::MalformedSkel { .. } => FS_MALFORMED_SKEL,
            FsError::CorruptNodeRevision { .. }
            | FsError::CorruptRevision { .. }
            | FsError::CorruptRepresentation { .. }
            | FsError::CloneConflict { .. } => FS_CORRUPT,
            FsError::DanglingId { .. } => FS_ID_NOT_FOUND,
            FsError::NotNodeRevisionId(_) => FS_NOT_ID,
            FsError::NotMutable(_) => FS_NOT_MUTABLE,
            FsError::RepNotMutable(_) => FS_REP_NOT_MUTABLE,
            FsError::NoSuchRevision(_) => FS_NO_SUCH_REVISION,
            FsError::NoSuchTransaction(_) => FS_NO_SUCH_TRANSACTION,
            FsError::NoSuchRepresentation(_) => FS_NO_SUCH_REPRESENTATION,
            FsError::NoSuchString(_) => FS_NO_SUCH_STRING,
            FsError::NoSuchCopy(_) => FS_NO_SUCH_COPY,
            FsError::NotFound(_) => FS_NOT_FOUND,
            FsError::AlreadyExists(_) => FS_ALREADY_EXISTS,
            FsError::NotDirectory(_) => FS_NOT_DIRECTORY,
            FsError::NotFile(_) => FS_NOT_FILE,
            FsError::RootDir => FS_ROOT_DIR,
            FsError::PathSyntax(_) => FS_PATH_SYNTAX,
            FsError::Conflict(_) => FS_CONFLICT,
            FsError::ChecksumMismatch { .. } => CHECKSUM_MISMATCH,
            FsError::PathAlreadyLocked { .. } => FS_PATH_ALREADY_LOCKED,
            FsError::NoSuchLock(_) => FS_NO_SUCH_LOCK,
            FsError::BadLockToken { .. } => FS_BAD_LOCK_TOKEN,
            FsError::LockOwnerMismatch { .. } => FS_LOCK_OWNER_MISMATCH,
            FsError::NoUser(_) => FS_NO_USER,
            FsError::BadDate(_) => BAD_DATE,
            FsError::Svndiff(_) => SVNDIFF_CORRUPT_WINDOW,
            FsError::Retryable(_) => FS_DB_DEADLOCK,
            FsError::Database(_) => FS_DB_ERROR,
            FsError::Io(_) => IO_ERROR,
            FsError::Config(_) => BAD_CONFIG,
            FsError::Cancelled => CANCELLED,
        }
    }

    /// Whether the storage engine asked for the whole trail to be re-run
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Retryable(_))
    }

    /// Whether this is a corruption-class error (never "absent")
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FsError::MalformedSkel { .. }
                | FsError::CorruptNodeRevision { .. }
                | FsError::CorruptRevision { .. }
                | FsError::CorruptRepresentation { .. }
                | FsError::CloneConflict { .. }
                | FsError::DanglingId { .. }
        )
    }

    pub(crate) fn malformed(kind: &'static str) -> Self {
        FsError::MalformedSkel { kind }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                FsError::Retryable(e.to_string())
            }
            _ => FsError::Database(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_taxonomy() {
        assert_eq!(FsError::malformed("revision").code(), codes::FS_MALFORMED_SKEL);
        assert_eq!(
            FsError::DanglingId {
                id: "1.1".into(),
                fs_path: "/r".into()
            }
            .code(),
            codes::FS_ID_NOT_FOUND
        );
        assert!(FsError::Retryable("busy".into()).is_retryable());
        assert!(!FsError::NotFound("/a".into()).is_retryable());
    }

    #[test]
    fn test_corruption_is_never_absence() {
        let e = FsError::CorruptNodeRevision {
            id: "0.0".into(),
            fs_path: "/repo".into(),
        };
        assert!(e.is_corruption());
        assert!(!FsError::NotFound("/x".into()).is_corruption());
        assert_eq!(
            e.to_string(),
            "Corrupt node revision for node '0.0' in filesystem '/repo'"
        );
    }
}
