//! The protocol seam between the adapter and a live FTP connection.
//!
//! [`FtpSession`] is one logged-in control connection. It reports server
//! refusals as `Ok(false)` / `Ok(None)` with the reply kept in
//! [`FtpSession::reply`], and reserves `Err` for transport failures: an
//! `io::Error` means the connection can no longer be trusted.

use std::fmt;
use std::io;

use async_trait::async_trait;
use kumofs_types::{HostFileName, RemoteEntry};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::vfs::VfsResult;

/// Read half of a data connection.
pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a data connection.
pub type DataWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Last reply read from the control connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Full reply text, continuation lines included.
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// 1xx: more replies follow.
    pub fn is_positive_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx.
    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: the server wants the next command of a sequence.
    pub fn is_positive_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx or 5xx.
    pub fn is_negative_completion(&self) -> bool {
        (400..600).contains(&self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.starts_with(&self.code.to_string()) {
            f.write_str(self.text.trim_end())
        } else {
            write!(f, "{} {}", self.code, self.text.trim_end())
        }
    }
}

/// One logged-in FTP control connection.
///
/// Paths are passed through to the server as given; relative paths resolve
/// against the session's working directory.
#[async_trait]
pub trait FtpSession: Send {
    /// False once the control connection has failed or been closed.
    fn is_connected(&self) -> bool;

    /// `LIST [path]`. A refused listing yields an empty vec; check
    /// [`FtpSession::reply`] to tell it apart from an empty directory.
    async fn list(&mut self, path: Option<&str>) -> io::Result<Vec<RemoteEntry>>;

    /// `PWD`. `None` when the server refuses or the reply is unparsable.
    async fn pwd(&mut self) -> io::Result<Option<String>>;

    async fn cwd(&mut self, path: &str) -> io::Result<bool>;

    async fn remove_directory(&mut self, path: &str) -> io::Result<bool>;

    async fn delete_file(&mut self, path: &str) -> io::Result<bool>;

    async fn rename(&mut self, from: &str, to: &str) -> io::Result<bool>;

    async fn make_directory(&mut self, path: &str) -> io::Result<bool>;

    /// `[REST offset] RETR path`. The transfer stays pending until
    /// [`FtpSession::complete_pending_command`].
    async fn retrieve(&mut self, path: &str, restart: Option<u64>)
        -> io::Result<Option<DataReader>>;

    /// `STOR path`, pending like [`FtpSession::retrieve`].
    async fn store(&mut self, path: &str) -> io::Result<Option<DataWriter>>;

    /// `APPE path`, pending like [`FtpSession::retrieve`].
    async fn append(&mut self, path: &str) -> io::Result<Option<DataWriter>>;

    /// Read the final reply of a transfer whose data connection is closed.
    async fn complete_pending_command(&mut self) -> io::Result<bool>;

    fn reply(&self) -> &Reply;

    /// Polite logout. Errors are worth logging, not acting on.
    async fn quit(&mut self) -> io::Result<()>;
}

/// Opens sessions for one kind of transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, log in and position the session at `root`'s base path.
    async fn connect(&self, root: &HostFileName) -> VfsResult<Box<dyn FtpSession>>;
}
