//! In-memory FTP server model.
//!
//! Used for testing. [`MockServer`] holds a tree of directories, files and
//! symbolic links shared by every session its connector opens, and answers
//! the session calls the way a typical Unix FTP daemon would. Knobs cover
//! the server quirks the adapter works around:
//!
//! - [`MockServer::reject_spaces`]: `LIST` arguments containing a space
//!   return an empty listing
//! - [`MockServer::refuse_list_arguments`]: only the working directory can
//!   be listed
//! - [`MockServer::include_dot_entries`]: listings contain `.` and `..`
//!
//! [`MockServer::on_list`] runs a callback while a listing is in flight.
//! Failures are injected with [`MockServer::fail_next`] (the next commands
//! break the connection) and [`MockServer::fail_completion`].

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kumofs_types::{HostFileName, RemoteEntry, normalize_path};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use super::session::{Connector, DataReader, DataWriter, FtpSession, Reply};
use crate::vfs::{VfsError, VfsResult};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug)]
struct ServerState {
    nodes: BTreeMap<String, Node>,
    home: String,
    modified: SystemTime,
    credentials: Option<(String, String)>,
    connects: usize,
    refuse_connections: bool,
    fail_commands: usize,
    fail_completion: bool,
    reject_spaces: bool,
    refuse_list_arguments: bool,
    dot_entries: bool,
    denied_cwd: HashSet<String>,
    log: Vec<String>,
}

impl ServerState {
    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn entry(&self, path: &str) -> Option<RemoteEntry> {
        let name = base_name(path);
        let entry = match self.nodes.get(path)? {
            Node::Dir => RemoteEntry::directory(name),
            Node::File(data) => RemoteEntry::file(name, data.len() as u64),
            Node::Symlink(target) => RemoteEntry::symlink(name, target.clone()),
        };
        Some(entry.with_modified(self.modified))
    }

    fn children(&self, dir: &str) -> Vec<RemoteEntry> {
        let mut entries = Vec::new();
        if self.dot_entries {
            entries.push(RemoteEntry::directory("."));
            entries.push(RemoteEntry::directory(".."));
        }
        entries.extend(
            self.nodes
                .keys()
                .filter(|path| path.as_str() != "/" && parent_of(path) == dir)
                .filter_map(|path| self.entry(path)),
        );
        entries
    }

    /// Follow symbolic links in every segment of `path` except the last,
    /// and in the last too when `follow_last` is set.
    fn resolve(&self, path: &str, follow_last: bool) -> Option<String> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut resolved = "/".to_string();
        let mut hops = 0;
        for (i, segment) in segments.iter().enumerate() {
            let mut next = child_of(&resolved, segment);
            if i + 1 < segments.len() || follow_last {
                while let Some(Node::Symlink(target)) = self.nodes.get(&next) {
                    hops += 1;
                    if hops > 16 {
                        return None;
                    }
                    next = if target.starts_with('/') {
                        normalize_path(target).ok()?
                    } else {
                        normalize_path(&format!("{}/{target}", parent_of(&next))).ok()?
                    };
                }
            }
            resolved = next;
        }
        Some(resolved)
    }

    fn insert(&mut self, path: &str, node: Node) {
        let Ok(path) = normalize_path(path) else {
            return;
        };
        let mut ancestor = parent_of(&path).to_string();
        while ancestor != "/" {
            self.nodes.entry(ancestor.clone()).or_insert(Node::Dir);
            ancestor = parent_of(&ancestor).to_string();
        }
        self.nodes.insert(path, node);
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.nodes
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }
}

type ListHook = Arc<dyn Fn() + Send + Sync>;

/// Shared server state; clones see the same tree.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    list_hook: Arc<Mutex<Option<ListHook>>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("state", &self.state)
            .field("list_hook", &self.list_hook.lock().is_some())
            .finish()
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Empty server: just `/`, which is also the login directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(ServerState {
                nodes,
                home: "/".to_string(),
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
                credentials: None,
                connects: 0,
                refuse_connections: false,
                fail_commands: 0,
                fail_completion: false,
                reject_spaces: false,
                refuse_list_arguments: false,
                dot_entries: false,
                denied_cwd: HashSet::new(),
                log: Vec::new(),
            })),
            list_hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Connector opening sessions on this server.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: self.clone(),
        })
    }

    // ========================================================================
    // Tree setup and inspection
    // ========================================================================

    /// Add a directory, creating missing ancestors.
    pub fn add_dir(&self, path: &str) {
        self.state.lock().insert(path, Node::Dir);
    }

    /// Add or replace a file, creating missing ancestors.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.state.lock().insert(path, Node::File(data.to_vec()));
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.state
            .lock()
            .insert(path, Node::Symlink(target.to_string()));
    }

    /// Remove a path and everything below it, as another client would.
    pub fn remove(&self, path: &str) {
        self.state.lock().remove_tree(path);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.state.lock().is_dir(path)
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    // ========================================================================
    // Behaviour knobs
    // ========================================================================

    /// Login directory. The URI path is entered relative to it.
    pub fn set_home(&self, path: &str) {
        self.state.lock().home = path.to_string();
    }

    /// Reject logins that do not carry exactly these credentials.
    pub fn require_login(&self, user: &str, password: &str) {
        self.state.lock().credentials = Some((user.to_string(), password.to_string()));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Break the connection on each of the next `count` commands.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_commands = count;
    }

    /// Answer transfer completion with `451` (uploads are not committed).
    pub fn fail_completion(&self, fail: bool) {
        self.state.lock().fail_completion = fail;
    }

    pub fn reject_spaces(&self, reject: bool) {
        self.state.lock().reject_spaces = reject;
    }

    pub fn refuse_list_arguments(&self, refuse: bool) {
        self.state.lock().refuse_list_arguments = refuse;
    }

    pub fn include_dot_entries(&self, include: bool) {
        self.state.lock().dot_entries = include;
    }

    /// Run `hook` whenever a `LIST` arrives, before it is answered.
    pub fn on_list(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.list_hook.lock() = Some(Arc::new(hook));
    }

    pub fn clear_list_hook(&self) {
        self.list_hook.lock().take();
    }

    /// Refuse `CWD` into `path`.
    pub fn deny_cwd(&self, path: &str) {
        self.state.lock().denied_cwd.insert(path.to_string());
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Sessions successfully opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Commands received, in order, as `VERB argument`.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// How many received commands start with `verb`.
    pub fn count_commands(&self, verb: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn open_session(&self, root: &HostFileName) -> VfsResult<Box<dyn FtpSession>> {
        let mut state = self.state.lock();
        let host = root.host().to_string();
        if state.refuse_connections {
            return Err(VfsError::ConnectionFailed {
                host,
                reason: "connection refused".into(),
            });
        }
        if let Some((user, password)) = &state.credentials {
            if root.user() != Some(user.as_str()) || root.password() != Some(password.as_str()) {
                return Err(VfsError::LoginFailed {
                    host,
                    reply: "530 Login incorrect.".into(),
                });
            }
        }
        let cwd = normalize_path(&format!("{}/{}", state.home, root.path()))
            .ok()
            .and_then(|dir| state.resolve(&dir, true))
            .filter(|dir| state.is_dir(dir));
        let Some(cwd) = cwd else {
            return Err(VfsError::ConnectionFailed {
                host,
                reason: format!("cannot change to {}", root.path()),
            });
        };
        state.connects += 1;

        Ok(Box::new(MockSession {
            server: self.clone(),
            cwd,
            connected: true,
            reply: Reply::new(230, "Login successful."),
            pending: None,
        }))
    }
}

struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, root: &HostFileName) -> VfsResult<Box<dyn FtpSession>> {
        self.server.open_session(root)
    }
}

enum Pending {
    Download,
    Upload {
        path: String,
        buffer: Arc<Mutex<Vec<u8>>>,
        append: bool,
    },
}

/// One session against a [`MockServer`].
pub struct MockSession {
    server: MockServer,
    cwd: String,
    connected: bool,
    reply: Reply,
    pending: Option<Pending>,
}

impl MockSession {
    /// Log `command`, then apply connection state and injected failures.
    fn begin(&mut self, state: &mut ServerState, command: String) -> io::Result<()> {
        state.log.push(command);
        if !self.connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        }
        if state.fail_commands > 0 {
            state.fail_commands -= 1;
            self.connected = false;
            self.pending = None;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        Ok(())
    }

    fn answer(&mut self, code: u16, text: &str) {
        self.reply = Reply::new(code, text);
    }

    /// Server path for `path`, with links in its parent segments followed.
    fn absolute(&self, state: &ServerState, path: &str) -> Option<String> {
        let joined = if path.starts_with('/') {
            normalize_path(path).ok()?
        } else {
            normalize_path(&format!("{}/{path}", self.cwd)).ok()?
        };
        state.resolve(&joined, false)
    }

    fn list_sync(&mut self, path: Option<&str>) -> io::Result<Vec<RemoteEntry>> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        let command = match path {
            Some(path) => format!("LIST {path}"),
            None => "LIST".to_string(),
        };
        self.begin(&mut state, command)?;

        let Some(arg) = path else {
            self.answer(226, "Directory send OK.");
            return Ok(state.children(&self.cwd));
        };
        if state.refuse_list_arguments {
            self.answer(550, "Permission denied.");
            return Ok(Vec::new());
        }
        if state.reject_spaces && arg.contains(' ') {
            self.answer(226, "Directory send OK.");
            return Ok(Vec::new());
        }

        if let Some(prefix) = arg.strip_suffix('*') {
            let (dir, stem) = match prefix.rfind('/') {
                Some(slash) => (&prefix[..=slash], &prefix[slash + 1..]),
                None => ("", prefix),
            };
            let dir = self
                .absolute(&state, dir)
                .and_then(|d| state.resolve(&d, true))
                .filter(|d| state.is_dir(d));
            let Some(dir) = dir else {
                self.answer(550, "No such file or directory.");
                return Ok(Vec::new());
            };
            self.answer(226, "Directory send OK.");
            return Ok(state
                .children(&dir)
                .into_iter()
                .filter(|e| !e.is_dot_entry() && e.name.starts_with(stem))
                .collect());
        }

        let target = self.absolute(&state, arg);
        match target.as_deref().map(|t| (t, state.nodes.get(t))) {
            Some((dir, Some(Node::Dir))) => {
                self.answer(226, "Directory send OK.");
                Ok(state.children(dir))
            }
            Some((path, Some(_))) => {
                self.answer(226, "Directory send OK.");
                Ok(state.entry(path).into_iter().collect())
            }
            _ => {
                self.answer(550, "No such file or directory.");
                Ok(Vec::new())
            }
        }
    }

    fn pwd_sync(&mut self) -> io::Result<Option<String>> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, "PWD".into())?;
        let cwd = self.cwd.clone();
        self.answer(257, &format!("\"{cwd}\" is the current directory"));
        Ok(Some(cwd))
    }

    fn cwd_sync(&mut self, path: &str) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, format!("CWD {path}"))?;

        let target = self
            .absolute(&state, path)
            .and_then(|t| state.resolve(&t, true));
        match target {
            Some(dir) if state.is_dir(&dir) && !state.denied_cwd.contains(&dir) => {
                self.cwd = dir;
                self.answer(250, "Directory successfully changed.");
                Ok(true)
            }
            _ => {
                self.answer(550, "Failed to change directory.");
                Ok(false)
            }
        }
    }

    fn remove_directory_sync(&mut self, path: &str) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, format!("RMD {path}"))?;
        match self.absolute(&state, path) {
            Some(dir) if dir != "/" && state.is_dir(&dir) && state.children(&dir).iter().all(RemoteEntry::is_dot_entry) => {
                state.nodes.remove(&dir);
                self.answer(250, "Remove directory operation successful.");
                Ok(true)
            }
            _ => {
                self.answer(550, "Remove directory operation failed.");
                Ok(false)
            }
        }
    }

    fn delete_file_sync(&mut self, path: &str) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, format!("DELE {path}"))?;
        let target = self.absolute(&state, path);
        match target.as_deref().and_then(|t| state.nodes.get(t)) {
            Some(Node::File(_)) | Some(Node::Symlink(_)) => {
                if let Some(target) = target {
                    state.nodes.remove(&target);
                }
                self.answer(250, "Delete operation successful.");
                Ok(true)
            }
            _ => {
                self.answer(550, "Delete operation failed.");
                Ok(false)
            }
        }
    }

    fn rename_sync(&mut self, from: &str, to: &str) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, format!("RNFR {from}"))?;
        let Some(source) = self.absolute(&state, from).filter(|s| state.nodes.contains_key(s)) else {
            self.answer(550, "RNFR command failed.");
            return Ok(false);
        };
        self.answer(350, "Ready for RNTO.");

        self.begin(&mut state, format!("RNTO {to}"))?;
        let dest = self
            .absolute(&state, to)
            .filter(|d| !state.nodes.contains_key(d) && state.is_dir(parent_of(d)));
        let Some(dest) = dest else {
            self.answer(553, "Rename failed.");
            return Ok(false);
        };

        let prefix = format!("{source}/");
        let moved: Vec<(String, Node)> = state
            .nodes
            .iter()
            .filter(|(key, _)| **key == source || key.starts_with(&prefix))
            .map(|(key, node)| (format!("{dest}{}", &key[source.len()..]), node.clone()))
            .collect();
        state.remove_tree(&source);
        state.nodes.extend(moved);
        self.answer(250, "Rename successful.");
        Ok(true)
    }

    fn make_directory_sync(&mut self, path: &str) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        self.begin(&mut state, format!("MKD {path}"))?;
        match self.absolute(&state, path) {
            Some(dir) if !state.nodes.contains_key(&dir) && state.is_dir(parent_of(&dir)) => {
                self.answer(257, &format!("\"{dir}\" created"));
                state.nodes.insert(dir, Node::Dir);
                Ok(true)
            }
            _ => {
                self.answer(550, "Create directory operation failed.");
                Ok(false)
            }
        }
    }

    fn retrieve_sync(&mut self, path: &str, restart: Option<u64>) -> io::Result<Option<DataReader>> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        let offset = restart.unwrap_or(0);
        if offset > 0 {
            self.begin(&mut state, format!("REST {offset}"))?;
            self.answer(350, &format!("Restart position accepted ({offset})."));
        }
        self.begin(&mut state, format!("RETR {path}"))?;

        let target = self
            .absolute(&state, path)
            .and_then(|t| state.resolve(&t, true));
        match target.as_deref().and_then(|t| state.nodes.get(t)) {
            Some(Node::File(data)) => {
                let start = (offset as usize).min(data.len());
                let reader = Cursor::new(data[start..].to_vec());
                self.pending = Some(Pending::Download);
                self.answer(150, "Opening BINARY mode data connection.");
                Ok(Some(Box::new(reader)))
            }
            _ => {
                self.answer(550, "Failed to open file.");
                Ok(None)
            }
        }
    }

    fn upload_sync(&mut self, path: &str, append: bool) -> io::Result<Option<DataWriter>> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        let verb = if append { "APPE" } else { "STOR" };
        self.begin(&mut state, format!("{verb} {path}"))?;

        let target = self
            .absolute(&state, path)
            .filter(|t| !state.is_dir(t) && state.is_dir(parent_of(t)));
        let Some(target) = target else {
            self.answer(553, "Could not create file.");
            return Ok(None);
        };
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.pending = Some(Pending::Upload {
            path: target,
            buffer: Arc::clone(&buffer),
            append,
        });
        self.answer(150, "Ok to send data.");
        Ok(Some(Box::new(MockWriter { buffer })))
    }

    fn complete_sync(&mut self) -> io::Result<bool> {
        let server = self.server.clone();
        let mut state = server.state.lock();
        if !self.connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        }
        if state.fail_commands > 0 {
            state.fail_commands -= 1;
            self.connected = false;
            self.pending = None;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }

        let Some(pending) = self.pending.take() else {
            return Ok(true);
        };
        if state.fail_completion {
            self.answer(451, "Transfer aborted: local error.");
            return Ok(false);
        }
        if let Pending::Upload {
            path,
            buffer,
            append,
        } = pending
        {
            let written = std::mem::take(&mut *buffer.lock());
            match state.nodes.get_mut(&path) {
                Some(Node::File(data)) if append => data.extend_from_slice(&written),
                _ => {
                    state.nodes.insert(path, Node::File(written));
                }
            }
        }
        self.answer(226, "Transfer complete.");
        Ok(true)
    }
}

#[async_trait]
impl FtpSession for MockSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list(&mut self, path: Option<&str>) -> io::Result<Vec<RemoteEntry>> {
        let hook = self.server.list_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        self.list_sync(path)
    }

    async fn pwd(&mut self) -> io::Result<Option<String>> {
        self.pwd_sync()
    }

    async fn cwd(&mut self, path: &str) -> io::Result<bool> {
        self.cwd_sync(path)
    }

    async fn remove_directory(&mut self, path: &str) -> io::Result<bool> {
        self.remove_directory_sync(path)
    }

    async fn delete_file(&mut self, path: &str) -> io::Result<bool> {
        self.delete_file_sync(path)
    }

    async fn rename(&mut self, from: &str, to: &str) -> io::Result<bool> {
        self.rename_sync(from, to)
    }

    async fn make_directory(&mut self, path: &str) -> io::Result<bool> {
        self.make_directory_sync(path)
    }

    async fn retrieve(
        &mut self,
        path: &str,
        restart: Option<u64>,
    ) -> io::Result<Option<DataReader>> {
        self.retrieve_sync(path, restart)
    }

    async fn store(&mut self, path: &str) -> io::Result<Option<DataWriter>> {
        self.upload_sync(path, false)
    }

    async fn append(&mut self, path: &str) -> io::Result<Option<DataWriter>> {
        self.upload_sync(path, true)
    }

    async fn complete_pending_command(&mut self) -> io::Result<bool> {
        self.complete_sync()
    }

    fn reply(&self) -> &Reply {
        &self.reply
    }

    async fn quit(&mut self) -> io::Result<()> {
        self.server.state.lock().log.push("QUIT".into());
        self.connected = false;
        self.answer(221, "Goodbye.");
        Ok(())
    }
}

/// Upload sink; contents land in the tree when the transfer completes.
struct MockWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.buffer.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(slash) => &path[..slash],
    }
}

fn child_of(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
