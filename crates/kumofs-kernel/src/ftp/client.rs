//! The protocol client adapter.
//!
//! [`FtpClient`] owns at most one [`FtpSession`] and layers two things on
//! top of it:
//!
//! - **Reconnect-and-retry-once.** Every operation that talks to the server
//!   runs through [`retry_once!`]. An I/O failure drops the session,
//!   reconnects and runs the operation again; a second I/O failure surfaces
//!   as [`VfsError::Transport`].
//! - **Type probing.** FTP has no portable "stat". [`FtpClient::get_file_or_directory`]
//!   combines exact and wildcard `LIST`s with a `CWD` round trip to decide
//!   whether a path is a file, a directory or absent.
//!
//! Paths given to the client are server paths, relative paths resolving
//! against the session's working directory.

use std::io;
use std::sync::Arc;

use kumofs_types::{HostFileName, RemoteEntry};

use super::session::{Connector, DataReader, DataWriter, FtpSession};
use crate::vfs::{VfsError, VfsResult};

/// Run `$call` against a live session, reconnecting and retrying once if it
/// fails with an I/O error.
macro_rules! retry_once {
    ($self:ident, $op:literal, $path:expr, |$s:ident| $call:expr) => {{
        let first = {
            let $s = $self.session().await?;
            $call.await.map_err(VfsError::from)
        };
        match first {
            Err(err) if err.is_transient() => {
                tracing::warn!(op = $op, path = %$path, error = %err, "session failed, reconnecting");
                $self.abort();
                let second = {
                    let $s = $self.session().await?;
                    $call.await.map_err(VfsError::from)
                };
                $self.settle($op, $path, second)
            }
            other => $self.settle($op, $path, other),
        }
    }};
}

/// One FTP connection with lazy reconnect.
pub struct FtpClient {
    root: HostFileName,
    connector: Arc<dyn Connector>,
    session: Option<Box<dyn FtpSession>>,
}

impl FtpClient {
    /// Connect immediately; handshake and login failures surface here.
    #[tracing::instrument(skip(connector), name = "ftp.client.connect")]
    pub async fn connect(root: HostFileName, connector: Arc<dyn Connector>) -> VfsResult<Self> {
        let session = connector.connect(&root).await?;
        Ok(Self {
            root,
            connector,
            session: Some(session),
        })
    }

    pub fn root(&self) -> &HostFileName {
        &self.root
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Log out and drop the session. The next operation reconnects.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.quit().await {
                tracing::debug!(error = %e, "error during logout");
            }
        }
    }

    /// Drop the session without any protocol exchange. Always succeeds.
    pub fn abort(&mut self) -> bool {
        self.session = None;
        true
    }

    /// Text of the last server reply; empty when there is no session.
    pub fn reply_string(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.reply().to_string())
            .unwrap_or_default()
    }

    /// Move the session into a fresh client, leaving this one unconnected.
    pub(crate) fn take(&mut self) -> FtpClient {
        FtpClient {
            root: self.root.clone(),
            connector: Arc::clone(&self.connector),
            session: self.session.take(),
        }
    }

    async fn session(&mut self) -> VfsResult<&mut dyn FtpSession> {
        if !self.is_connected() {
            self.session = None;
            tracing::info!(root = %self.root, "connecting");
            self.session = Some(self.connector.connect(&self.root).await?);
        }
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(VfsError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no FTP session",
            ))),
        }
    }

    /// Final mapping of an operation's outcome. Sessions that failed in a way
    /// that leaves them untrustworthy are dropped.
    fn settle<T>(&mut self, op: &'static str, path: &str, result: VfsResult<T>) -> VfsResult<T> {
        match result {
            Err(VfsError::Io(source)) => {
                self.session = None;
                Err(VfsError::Transport {
                    op,
                    path: path.to_string(),
                    source,
                })
            }
            Err(err @ VfsError::WorkingDirectoryRestore(_)) => {
                tracing::warn!(op, path, "working directory lost, dropping session");
                self.session = None;
                Err(err)
            }
            other => other,
        }
    }

    // ========================================================================
    // Directory operations
    // ========================================================================

    /// List `path` (the working directory when empty). `None` when the
    /// server refuses both a direct listing and a listing from inside the
    /// directory.
    #[tracing::instrument(skip(self), name = "ftp.list")]
    pub async fn list(&mut self, path: &str) -> VfsResult<Option<Vec<RemoteEntry>>> {
        retry_once!(self, "list", path, |s| list_files(s, path))
    }

    #[tracing::instrument(skip(self), name = "ftp.rmdir")]
    pub async fn remove_directory(&mut self, path: &str) -> VfsResult<bool> {
        retry_once!(self, "remove_directory", path, |s| s.remove_directory(path))
    }

    #[tracing::instrument(skip(self), name = "ftp.delete")]
    pub async fn delete_file(&mut self, path: &str) -> VfsResult<bool> {
        retry_once!(self, "delete_file", path, |s| s.delete_file(path))
    }

    #[tracing::instrument(skip(self), name = "ftp.rename")]
    pub async fn rename(&mut self, from: &str, to: &str) -> VfsResult<bool> {
        retry_once!(self, "rename", from, |s| s.rename(from, to))
    }

    #[tracing::instrument(skip(self), name = "ftp.mkdir")]
    pub async fn make_directory(&mut self, path: &str) -> VfsResult<bool> {
        retry_once!(self, "make_directory", path, |s| s.make_directory(path))
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Open a download, optionally restarting at `restart_offset`.
    #[tracing::instrument(skip(self), name = "ftp.retrieve")]
    pub async fn retrieve_file_stream(
        &mut self,
        path: &str,
        restart_offset: Option<u64>,
    ) -> VfsResult<Option<DataReader>> {
        retry_once!(self, "retrieve", path, |s| s.retrieve(path, restart_offset))
    }

    #[tracing::instrument(skip(self), name = "ftp.append")]
    pub async fn append_file_stream(&mut self, path: &str) -> VfsResult<Option<DataWriter>> {
        retry_once!(self, "append", path, |s| s.append(path))
    }

    #[tracing::instrument(skip(self), name = "ftp.store")]
    pub async fn store_file_stream(&mut self, path: &str) -> VfsResult<Option<DataWriter>> {
        retry_once!(self, "store", path, |s| s.store(path))
    }

    /// Read the final reply of an open transfer. Not retried: a fresh
    /// session has nothing pending.
    pub async fn complete_pending_command(&mut self) -> VfsResult<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(true);
        };
        match session.complete_pending_command().await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.session = None;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Type probing
    // ========================================================================

    /// Find the listing entry describing `path`, or `None` if it does not
    /// exist.
    #[tracing::instrument(skip(self), name = "ftp.stat")]
    pub async fn get_file_or_directory(&mut self, path: &str) -> VfsResult<Option<RemoteEntry>> {
        retry_once!(self, "get_file_or_directory", path, |s| probe(s, path))
    }
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("root", &self.root)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn list_files(s: &mut dyn FtpSession, path: &str) -> VfsResult<Option<Vec<RemoteEntry>>> {
    let entries = s.list((!path.is_empty()).then_some(path)).await?;
    if s.reply().is_positive_completion() {
        return Ok(Some(entries));
    }

    // Some servers only list the working directory.
    let Some(previous) = s.pwd().await? else {
        return Ok(None);
    };
    if !s.cwd(path).await? {
        return Ok(None);
    }
    let entries = s.list(None).await?;
    let listed = s.reply().is_positive_completion();
    if !s.cwd(&previous).await? {
        return Err(VfsError::WorkingDirectoryRestore(previous));
    }
    Ok(listed.then_some(entries))
}

async fn probe(s: &mut dyn FtpSession, path: &str) -> VfsResult<Option<RemoteEntry>> {
    if path.is_empty() {
        return Ok(None);
    }
    if final_segment(path).contains('.') {
        probe_as_file(s, path).await
    } else {
        probe_as_directory(s, path).await
    }
}

async fn probe_as_file(s: &mut dyn FtpSession, path: &str) -> VfsResult<Option<RemoteEntry>> {
    let mut entries = named(s.list(Some(path)).await?);
    if s.reply().is_negative_completion() {
        return Ok(None);
    }

    match entries.len() {
        0 => probe_with_spaces(s, path).await,
        1 => {
            let entry = &entries[0];
            if entry.is_dir() || !suffix_matches(path, &entry.name) {
                return probe_as_directory(s, path).await;
            }
            // A directory can hold a single file of its own name; only a
            // CWD tells them apart.
            let Some(previous) = s.pwd().await? else {
                return Ok(entries.pop());
            };
            if !s.cwd(path).await? {
                return Ok(entries.pop());
            }
            if !s.cwd(&previous).await? {
                return Err(VfsError::WorkingDirectoryRestore(previous));
            }
            probe_as_directory(s, path).await
        }
        _ => probe_as_directory(s, path).await,
    }
}

async fn probe_as_directory(s: &mut dyn FtpSession, path: &str) -> VfsResult<Option<RemoteEntry>> {
    let entries = named(s.list(Some(&format!("{path}*"))).await?);
    if s.reply().is_negative_completion() {
        return Ok(None);
    }
    if entries.is_empty() {
        return probe_with_spaces(s, path).await;
    }
    Ok(entries
        .into_iter()
        .find(|entry| suffix_matches(path, &entry.name)))
}

/// Fallback for servers that return nothing for a `LIST` containing a space:
/// list everything up to the first space and match exact names.
async fn probe_with_spaces(s: &mut dyn FtpSession, path: &str) -> VfsResult<Option<RemoteEntry>> {
    let (dir_prefix, last) = match path.rfind('/') {
        Some(slash) => path.split_at(slash + 1),
        None => ("", path),
    };
    if last.is_empty() || !last.contains(' ') || dir_prefix.contains(' ') {
        return Ok(None);
    }
    let Some(space) = path.find(' ') else {
        return Ok(None);
    };

    let entries = named(s.list(Some(&format!("{}*", &path[..space]))).await?);
    if s.reply().is_negative_completion() {
        return Ok(None);
    }
    Ok(entries
        .into_iter()
        .find(|entry| format!("{dir_prefix}{}", entry.name) == path))
}

fn named(entries: Vec<RemoteEntry>) -> Vec<RemoteEntry> {
    entries.into_iter().filter(|e| !e.name.is_empty()).collect()
}

fn final_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True when `name` is `path` itself or its last segments.
fn suffix_matches(path: &str, name: &str) -> bool {
    let name = name.trim_end_matches('/');
    if name.is_empty() || !path.ends_with(name) {
        return false;
    }
    let head = &path[..path.len() - name.len()];
    head.is_empty() || head.ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::mock::MockServer;

    fn server() -> MockServer {
        let server = MockServer::new();
        server.add_dir("/pub");
        server.add_file("/pub/readme.txt", b"hello");
        server.add_dir("/pub/sub");
        server.add_file("/pub/sub/one.bin", b"1");
        server.add_file("/pub/sub/two.bin", b"2");
        server.add_dir("/pub/archive");
        server.add_file("/pub/archive/notes.txt", b"n");
        server.add_dir("/pub/data.v1");
        server.add_file("/pub/data.v1/data.v1", b"nested");
        server
    }

    async fn client(server: &MockServer) -> FtpClient {
        FtpClient::connect(HostFileName::parse_ftp("ftp://mock/").unwrap(), server.connector())
            .await
            .unwrap()
    }

    #[test]
    fn test_suffix_matches() {
        assert!(suffix_matches("pub/a.txt", "a.txt"));
        assert!(suffix_matches("a.txt", "a.txt"));
        assert!(suffix_matches("/pub/a.txt", "/pub/a.txt"));
        assert!(!suffix_matches("pub/xa.txt", "a.txt"));
        assert!(!suffix_matches("pub/a.txt", "b.txt"));
    }

    #[tokio::test]
    async fn test_connect_fails_fast() {
        let server = server();
        server.refuse_connections(true);
        let result =
            FtpClient::connect(HostFileName::parse_ftp("ftp://mock/").unwrap(), server.connector())
                .await;
        assert!(matches!(result, Err(VfsError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_one_failure() {
        let server = server();
        let mut client = client(&server).await;
        assert_eq!(server.connect_count(), 1);

        server.fail_next(1);
        let entries = client.list("pub").await.unwrap().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(server.connect_count(), 2);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_two_failures_propagate() {
        let server = server();
        let mut client = client(&server).await;

        server.fail_next(2);
        let err = client.delete_file("pub/readme.txt").await.unwrap_err();
        assert!(matches!(err, VfsError::Transport { op: "delete_file", .. }));
        assert_eq!(server.connect_count(), 2);
        assert!(!client.is_connected());
        assert!(server.exists("/pub/readme.txt"));

        // Next call reconnects lazily.
        assert!(client.delete_file("pub/readme.txt").await.unwrap());
        assert_eq!(server.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_not_retried_again() {
        let server = server();
        let mut client = client(&server).await;

        server.fail_next(1);
        server.refuse_connections(true);
        let err = client.make_directory("pub/new").await.unwrap_err();
        assert!(matches!(err, VfsError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_probe_file_and_directory() {
        let server = server();
        let mut client = client(&server).await;

        let file = client.get_file_or_directory("pub/readme.txt").await.unwrap().unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 5);

        let dir = client.get_file_or_directory("pub/sub").await.unwrap().unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.name, "sub");

        assert!(client.get_file_or_directory("pub/missing").await.unwrap().is_none());
        assert!(client.get_file_or_directory("pub/missing.txt").await.unwrap().is_none());
        assert!(client.get_file_or_directory("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_is_idempotent() {
        let server = server();
        let mut client = client(&server).await;

        let first = client.get_file_or_directory("pub/readme.txt").await.unwrap();
        let second = client.get_file_or_directory("pub/readme.txt").await.unwrap();
        assert_eq!(first, second);

        let first = client.get_file_or_directory("pub/sub").await.unwrap();
        let second = client.get_file_or_directory("pub/sub").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_single_entry_with_other_name_is_directory() {
        let server = server();
        let mut client = client(&server).await;

        // Dotted name, but it is a directory holding one differently named file.
        server.add_dir("/pub/v1.2");
        server.add_file("/pub/v1.2/build.log", b"ok");
        let entry = client.get_file_or_directory("pub/v1.2").await.unwrap().unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.name, "v1.2");
    }

    #[tokio::test]
    async fn test_same_name_directory_needs_cwd() {
        let server = server();
        let mut client = client(&server).await;

        server.clear_log();
        let entry = client.get_file_or_directory("pub/data.v1").await.unwrap().unwrap();
        assert!(entry.is_dir());
        let log = server.commands();
        assert!(log.contains(&"CWD pub/data.v1".to_string()));
        assert!(log.contains(&"CWD /".to_string()));

        // The nested file of the same name: CWD fails, so it is the file.
        let entry = client
            .get_file_or_directory("pub/data.v1/data.v1")
            .await
            .unwrap()
            .unwrap();
        assert!(entry.is_file());
    }

    #[tokio::test]
    async fn test_failed_cwd_restore_is_fatal() {
        let server = server();
        let mut client = client(&server).await;

        server.deny_cwd("/");
        let err = client.get_file_or_directory("pub/data.v1").await.unwrap_err();
        assert!(matches!(err, VfsError::WorkingDirectoryRestore(ref dir) if dir == "/"));
        assert!(!client.is_connected());
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_space_tolerant_fallback() {
        let server = server();
        server.reject_spaces(true);
        server.add_file("/pub/my report.txt", b"r");
        server.add_dir("/pub/my photos");
        let mut client = client(&server).await;

        let file = client.get_file_or_directory("pub/my report.txt").await.unwrap().unwrap();
        assert!(file.is_file());
        let dir = client.get_file_or_directory("pub/my photos").await.unwrap().unwrap();
        assert!(dir.is_dir());
        assert!(client.get_file_or_directory("pub/my other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_falls_back_to_cwd() {
        let server = server();
        server.refuse_list_arguments(true);
        let mut client = client(&server).await;

        let entries = client.list("pub/sub").await.unwrap().unwrap();
        let mut names: Vec<_> = entries.into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, ["one.bin", "two.bin"]);
        assert!(server.commands().ends_with(&["LIST".to_string(), "CWD /".to_string()]));

        assert!(client.list("pub/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abort_and_reply_string() {
        let server = server();
        let mut client = client(&server).await;

        assert!(!client.remove_directory("pub/sub").await.unwrap());
        assert!(client.reply_string().starts_with("550"));
        assert!(client.abort());
        assert!(!client.is_connected());
        assert_eq!(client.reply_string(), "");
        assert!(client.abort());
    }

    #[tokio::test]
    async fn test_complete_pending_without_session() {
        let server = server();
        let mut client = client(&server).await;
        client.disconnect().await;
        assert!(client.complete_pending_command().await.unwrap());
        assert_eq!(server.connect_count(), 1);
    }
}
