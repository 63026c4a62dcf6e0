//! VFS error types.

use std::io;

use kumofs_types::NameError;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Path already exists with an incompatible type.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Malformed connection string.
    #[error("invalid name: {0}")]
    Name(#[from] NameError),

    /// TCP connect or greeting failed.
    #[error("cannot connect to {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// The server rejected the credentials.
    #[error("login to {host} failed: {reply}")]
    LoginFailed { host: String, reply: String },

    /// The server answered an operation with a negative reply.
    #[error("{op} failed for {path}: {reply}")]
    OperationFailed {
        op: &'static str,
        path: String,
        reply: String,
    },

    /// The previous working directory could not be restored after a probe.
    /// The session is no longer trustworthy.
    #[error("could not change working directory back to {0}")]
    WorkingDirectoryRestore(String),

    /// A transfer stream closed but the server did not confirm completion.
    #[error("{op} of {path} did not complete: {reply}")]
    StreamFinalization {
        op: &'static str,
        path: String,
        reply: String,
    },

    /// I/O failed again after a forced reconnect.
    #[error("{op} failed for {path} after reconnect: {source}")]
    Transport {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    /// Too many symbolic links.
    #[error("too many symbolic links: {0}")]
    TooManySymlinks(String),

    /// The client pool has been closed.
    #[error("client pool is closed")]
    PoolClosed,

    /// Bad configuration.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an OperationFailed error.
    pub fn operation_failed(
        op: &'static str,
        path: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            op,
            path: path.into(),
            reply: reply.into(),
        }
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a forced reconnect and one retry may recover from this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_is_transient() {
        let io_err = VfsError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io_err.is_transient());
        assert!(!VfsError::WorkingDirectoryRestore("/".into()).is_transient());
        assert!(!VfsError::not_found("x").is_transient());
    }

    #[test]
    fn test_messages_carry_path_and_op() {
        let err = VfsError::operation_failed("delete", "pub/a.txt", "550 Permission denied");
        assert_eq!(err.to_string(), "delete failed for pub/a.txt: 550 Permission denied");

        let err = VfsError::Transport {
            op: "list",
            path: "pub".into(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert!(err.to_string().starts_with("list failed for pub after reconnect"));
    }
}
