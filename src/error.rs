//! Error types for replifs.
//!
//! All fallible operations return [`Result`], built on the single [`FsError`]
//! enum. Errors that cross the wire are first narrowed to a [`Status`] code;
//! the set of codes is a stability contract shared with clients and must not
//! be reordered.
//!
//! # Error Categories
//!
//! - **Consensus**: leadership and proposal failures (`NotLeader`, `NoLeader`)
//! - **Filesystem**: path and store failures (`FileNotFound`, `AlreadyExists`,
//!   `NotDirectory`, `DirectoryNotEmpty`, `InvalidPath`)
//! - **Transport**: framing and network failures (`Serialization`, `Network`,
//!   `Timeout`)
//! - **Ambient**: configuration and internal failures, surfaced as `IoError`
//!   on the wire
//!
//! # Example
//!
//! ```rust
//! use replifs::error::{FsError, Status};
//!
//! let err = FsError::FileNotFound("logs/app.log".into());
//! assert_eq!(err.status(), Status::FileNotFound);
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for replifs operations.
#[derive(Error, Debug)]
pub enum FsError {
    // Consensus errors
    #[error("not leader, current leader is: {}", leader.as_deref().unwrap_or("<unknown>"))]
    NotLeader { leader: Option<String> },

    #[error("no leader elected")]
    NoLeader,

    #[error("raft error: {0}")]
    Raft(String),

    // Filesystem errors
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    // Transport errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    // Ambient errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire-stable status codes.
///
/// Every response frame carries exactly one of these. The mapping from
/// [`FsError`] is lossy on purpose: internal distinctions collapse into
/// `IoError` rather than leaking new codes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotLeader,
    NoLeaderAvailable,
    FileNotFound,
    AlreadyExists,
    NotDirectory,
    DirectoryNotEmpty,
    InvalidPath,
    IoError,
    SerializationError,
    NetworkError,
    Timeout,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "Ok",
            Status::NotLeader => "NotLeader",
            Status::NoLeaderAvailable => "NoLeaderAvailable",
            Status::FileNotFound => "FileNotFound",
            Status::AlreadyExists => "AlreadyExists",
            Status::NotDirectory => "NotDirectory",
            Status::DirectoryNotEmpty => "DirectoryNotEmpty",
            Status::InvalidPath => "InvalidPath",
            Status::IoError => "IoError",
            Status::SerializationError => "SerializationError",
            Status::NetworkError => "NetworkError",
            Status::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

impl FsError {
    /// Narrow this error to its wire status code.
    pub fn status(&self) -> Status {
        match self {
            FsError::NotLeader { .. } => Status::NotLeader,
            FsError::NoLeader => Status::NoLeaderAvailable,
            FsError::FileNotFound(_) => Status::FileNotFound,
            FsError::AlreadyExists(_) => Status::AlreadyExists,
            FsError::NotDirectory(_) => Status::NotDirectory,
            FsError::DirectoryNotEmpty(_) => Status::DirectoryNotEmpty,
            FsError::InvalidPath(_) => Status::InvalidPath,
            FsError::Serialization(_) => Status::SerializationError,
            FsError::Network(_) => Status::NetworkError,
            FsError::Timeout(_) => Status::Timeout,
            FsError::Raft(_) | FsError::Config(_) | FsError::Io(_) | FsError::Internal(_) => {
                Status::IoError
            }
        }
    }

    /// Map a syscall failure for `path` to the taxonomy by errno.
    pub fn from_errno(err: io::Error, path: &str) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => FsError::FileNotFound(path.to_string()),
            Some(libc::EEXIST) => FsError::AlreadyExists(path.to_string()),
            Some(libc::ENOTDIR) => FsError::NotDirectory(path.to_string()),
            Some(libc::ENOTEMPTY) => FsError::DirectoryNotEmpty(path.to_string()),
            Some(libc::EINVAL) => FsError::InvalidPath(path.to_string()),
            _ => FsError::Io(err),
        }
    }

    /// Rebuild an error from a wire status and message (client side).
    ///
    /// The NotLeader message format is our own (`Display` of
    /// [`FsError::NotLeader`]), so the leader address can be recovered from
    /// it.
    pub fn from_status(status: Status, message: String) -> Self {
        match status {
            Status::Ok => FsError::Internal("Ok status carried as an error".into()),
            Status::NotLeader => {
                let leader = message
                    .rsplit("current leader is: ")
                    .next()
                    .filter(|addr| !addr.is_empty() && *addr != "<unknown>" && *addr != message)
                    .map(str::to_string);
                FsError::NotLeader { leader }
            }
            Status::NoLeaderAvailable => FsError::NoLeader,
            Status::FileNotFound => FsError::FileNotFound(message),
            Status::AlreadyExists => FsError::AlreadyExists(message),
            Status::NotDirectory => FsError::NotDirectory(message),
            Status::DirectoryNotEmpty => FsError::DirectoryNotEmpty(message),
            Status::InvalidPath => FsError::InvalidPath(message),
            Status::IoError => FsError::Io(io::Error::new(io::ErrorKind::Other, message)),
            Status::SerializationError => FsError::Serialization(message),
            Status::NetworkError => FsError::Network(message),
            Status::Timeout => FsError::Timeout(message),
        }
    }

    /// Check if the caller may retry against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FsError::NotLeader { .. } | FsError::NoLeader | FsError::Timeout(_) | FsError::Network(_)
        )
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<rocksdb::Error> for FsError {
    fn from(e: rocksdb::Error) -> Self {
        FsError::Raft(format!("storage: {}", e))
    }
}

/// Result type alias for replifs operations.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let err = FsError::from_errno(io::Error::from_raw_os_error(libc::ENOENT), "a/b");
        assert!(matches!(err, FsError::FileNotFound(_)));

        let err = FsError::from_errno(io::Error::from_raw_os_error(libc::ENOTEMPTY), "d");
        assert_eq!(err.status(), Status::DirectoryNotEmpty);

        let err = FsError::from_errno(io::Error::from_raw_os_error(libc::EACCES), "x");
        assert_eq!(err.status(), Status::IoError);
    }

    #[test]
    fn from_status_recovers_leader_address() {
        let original = FsError::NotLeader {
            leader: Some("10.0.0.2:8100".into()),
        };
        let rebuilt = FsError::from_status(original.status(), original.to_string());
        match rebuilt {
            FsError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("10.0.0.2:8100")),
            other => panic!("unexpected: {:?}", other),
        }

        let unknown = FsError::from_status(Status::NotLeader, "not leader".into());
        assert!(matches!(unknown, FsError::NotLeader { leader: None }));
    }

    #[test]
    fn not_leader_message_carries_address() {
        let err = FsError::NotLeader {
            leader: Some("127.0.0.1:8100".into()),
        };
        assert!(err.to_string().contains("127.0.0.1:8100"));
        assert!(err.is_retryable());
    }
}
