//! FTP over TCP.
//!
//! A control connection on tokio's `TcpStream` plus passive-mode data
//! connections. The data connection goes to the control peer's address on
//! the port the `227` reply advertises; the advertised address is ignored
//! since servers behind NAT routinely report a private one.
//!
//! Transfers follow the usual two-reply shape: a `1xx` when the data
//! connection opens, and a final reply once it closes. [`WireSession::list`]
//! consumes both; stream transfers leave the final reply for
//! [`FtpSession::complete_pending_command`].

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use kumofs_types::{HostFileName, RemoteEntry};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::listing::parse_listing;
use super::session::{Connector, DataReader, DataWriter, FtpSession, Reply};
use crate::config::FtpFsConfig;
use crate::vfs::{VfsError, VfsResult};

/// User name sent when the URI carries none.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Production connector: one TCP control connection per session.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: FtpFsConfig,
}

impl TcpConnector {
    pub fn new(config: FtpFsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, root: &HostFileName) -> VfsResult<Box<dyn FtpSession>> {
        let session = WireSession::connect(root, &self.config).await?;
        Ok(Box::new(session))
    }
}

/// One logged-in control connection.
pub struct WireSession {
    /// `None` once the connection failed or was closed.
    control: Option<BufReader<TcpStream>>,
    peer: IpAddr,
    reply: Reply,
    /// A transfer's final reply is still unread.
    pending: bool,
    connect_timeout: Duration,
    control_timeout: Duration,
    data_timeout: Duration,
}

impl WireSession {
    /// Connect, read the greeting, log in, switch to binary and change to
    /// the root's base path.
    #[tracing::instrument(skip(root, config), name = "ftp.wire.connect", fields(host = %root.host(), port = root.port()))]
    pub async fn connect(root: &HostFileName, config: &FtpFsConfig) -> VfsResult<Self> {
        let host = root.host().to_string();
        let failed = |reason: String| VfsError::ConnectionFailed {
            host: host.clone(),
            reason,
        };

        let stream = timeout(
            config.connect_timeout(),
            TcpStream::connect((root.host(), root.port())),
        )
        .await
        .map_err(|_| failed("connect timed out".into()))?
        .map_err(|e| failed(e.to_string()))?;
        let peer = stream.peer_addr().map_err(|e| failed(e.to_string()))?.ip();

        let mut session = Self {
            control: Some(BufReader::new(stream)),
            peer,
            reply: Reply::default(),
            pending: false,
            connect_timeout: config.connect_timeout(),
            control_timeout: config.control_timeout(),
            data_timeout: config.data_timeout(),
        };

        let greeting = session
            .roundtrip(None)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !greeting.is_positive_completion() {
            return Err(failed(greeting.to_string()));
        }

        session.login(root, config).await?;

        let binary = session
            .roundtrip(Some("TYPE I"))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !binary.is_positive_completion() {
            return Err(failed(format!("binary mode refused: {binary}")));
        }

        let base = base_directory(root.path(), config.user_dir_is_root);
        if !base.is_empty() {
            let entered = session.cwd(base).await.map_err(|e| failed(e.to_string()))?;
            if !entered {
                return Err(failed(format!("cannot change to {base}: {}", session.reply)));
            }
        }

        tracing::debug!("session ready");
        Ok(session)
    }

    async fn login(&mut self, root: &HostFileName, config: &FtpFsConfig) -> VfsResult<()> {
        let user = root.user().unwrap_or(ANONYMOUS_USER);
        let password = match root.password() {
            Some(password) => password.to_string(),
            None if user == ANONYMOUS_USER => config.anonymous_password.clone(),
            None => String::new(),
        };
        let login_failed = |reply: String| VfsError::LoginFailed {
            host: root.host().to_string(),
            reply,
        };

        let mut reply = self
            .roundtrip(Some(&format!("USER {user}")))
            .await
            .map_err(|e| login_failed(e.to_string()))?;
        if reply.is_positive_intermediate() {
            reply = self
                .roundtrip(Some(&format!("PASS {password}")))
                .await
                .map_err(|e| login_failed(e.to_string()))?;
        }
        if !reply.is_positive_completion() {
            return Err(login_failed(reply.to_string()));
        }
        tracing::debug!(user, "logged in");
        Ok(())
    }

    /// Send `command` (if any) and read one reply. Any failure closes the
    /// session.
    async fn roundtrip(&mut self, command: Option<&str>) -> io::Result<Reply> {
        match command {
            Some(c) if c.starts_with("PASS ") => tracing::trace!(command = "PASS ****"),
            Some(c) => tracing::trace!(command = c),
            None => {}
        }

        let Some(control) = self.control.as_mut() else {
            return Err(not_connected());
        };
        let exchange = async {
            if let Some(command) = command {
                let stream = control.get_mut();
                stream.write_all(command.as_bytes()).await?;
                stream.write_all(b"\r\n").await?;
                stream.flush().await?;
            }
            read_reply(control).await
        };

        match timeout(self.control_timeout, exchange).await {
            Ok(Ok(reply)) => {
                tracing::trace!(code = reply.code, "reply");
                self.reply = reply.clone();
                Ok(reply)
            }
            Ok(Err(e)) => Err(self.broken(e)),
            Err(_) => Err(self.broken(timed_out("control reply"))),
        }
    }

    fn broken(&mut self, err: io::Error) -> io::Error {
        tracing::debug!(error = %err, "control connection lost");
        self.control = None;
        self.pending = false;
        err
    }

    async fn simple(&mut self, command: String) -> io::Result<bool> {
        Ok(self.roundtrip(Some(&command)).await?.is_positive_completion())
    }

    /// PASV, open the data connection, then send `command`. `None` when the
    /// server refuses either step.
    async fn open_transfer(&mut self, command: &str) -> io::Result<Option<TcpStream>> {
        let pasv = self.roundtrip(Some("PASV")).await?;
        if pasv.code != 227 {
            return Ok(None);
        }
        let Some(port) = parse_pasv_port(&pasv.text) else {
            return Err(self.broken(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable PASV reply: {pasv}"),
            )));
        };

        let data = match timeout(self.connect_timeout, TcpStream::connect((self.peer, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.broken(e)),
            Err(_) => return Err(self.broken(timed_out("data connection"))),
        };

        let reply = self.roundtrip(Some(command)).await?;
        if reply.is_positive_preliminary() {
            Ok(Some(data))
        } else {
            Ok(None)
        }
    }

    async fn open_upload(&mut self, command: String) -> io::Result<Option<DataWriter>> {
        let data = self.open_transfer(&command).await?;
        self.pending = data.is_some();
        Ok(data.map(|stream| Box::new(stream) as DataWriter))
    }
}

#[async_trait]
impl FtpSession for WireSession {
    fn is_connected(&self) -> bool {
        self.control.is_some()
    }

    async fn list(&mut self, path: Option<&str>) -> io::Result<Vec<RemoteEntry>> {
        let command = match path {
            Some(path) => format!("LIST {path}"),
            None => "LIST".to_string(),
        };
        let Some(mut data) = self.open_transfer(&command).await? else {
            return Ok(Vec::new());
        };

        let mut raw = Vec::new();
        let read = timeout(self.data_timeout, data.read_to_end(&mut raw)).await;
        drop(data);
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.broken(e)),
            Err(_) => return Err(self.broken(timed_out("listing transfer"))),
        }

        let done = self.roundtrip(None).await?;
        let entries = parse_listing(&String::from_utf8_lossy(&raw));
        tracing::debug!(?path, entries = entries.len(), code = done.code, "listed");
        Ok(entries)
    }

    async fn pwd(&mut self) -> io::Result<Option<String>> {
        let reply = self.roundtrip(Some("PWD")).await?;
        if reply.code != 257 {
            return Ok(None);
        }
        Ok(parse_quoted_path(&reply.text))
    }

    async fn cwd(&mut self, path: &str) -> io::Result<bool> {
        self.simple(format!("CWD {path}")).await
    }

    async fn remove_directory(&mut self, path: &str) -> io::Result<bool> {
        self.simple(format!("RMD {path}")).await
    }

    async fn delete_file(&mut self, path: &str) -> io::Result<bool> {
        self.simple(format!("DELE {path}")).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> io::Result<bool> {
        let reply = self.roundtrip(Some(&format!("RNFR {from}"))).await?;
        if !reply.is_positive_intermediate() {
            return Ok(false);
        }
        self.simple(format!("RNTO {to}")).await
    }

    async fn make_directory(&mut self, path: &str) -> io::Result<bool> {
        self.simple(format!("MKD {path}")).await
    }

    async fn retrieve(
        &mut self,
        path: &str,
        restart: Option<u64>,
    ) -> io::Result<Option<DataReader>> {
        if let Some(offset) = restart.filter(|&o| o > 0) {
            let reply = self.roundtrip(Some(&format!("REST {offset}"))).await?;
            if !reply.is_positive_intermediate() {
                return Ok(None);
            }
        }
        let data = self.open_transfer(&format!("RETR {path}")).await?;
        self.pending = data.is_some();
        Ok(data.map(|stream| Box::new(stream) as DataReader))
    }

    async fn store(&mut self, path: &str) -> io::Result<Option<DataWriter>> {
        self.open_upload(format!("STOR {path}")).await
    }

    async fn append(&mut self, path: &str) -> io::Result<Option<DataWriter>> {
        self.open_upload(format!("APPE {path}")).await
    }

    async fn complete_pending_command(&mut self) -> io::Result<bool> {
        if !self.pending {
            return Ok(true);
        }
        self.pending = false;
        Ok(self.roundtrip(None).await?.is_positive_completion())
    }

    fn reply(&self) -> &Reply {
        &self.reply
    }

    async fn quit(&mut self) -> io::Result<()> {
        if self.control.is_none() {
            return Ok(());
        }
        let result = self.roundtrip(Some("QUIT")).await.map(|_| ());
        self.control = None;
        result
    }
}

/// Directory to enter after login; empty to stay in the login directory.
/// With `user_dir_is_root` the URI path is taken relative to it.
fn base_directory(path: &str, user_dir_is_root: bool) -> &str {
    if user_dir_is_root {
        path.trim_start_matches('/')
    } else {
        path
    }
}

/// Read one possibly multi-line reply (`123-...` through `123 ...`).
async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Reply> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(closed());
    }
    let code = reply_code(&line)?;
    let mut text = line.clone();

    if line.as_bytes().get(3) == Some(&b'-') {
        let last = format!("{code:03} ");
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(closed());
            }
            text.push_str(&line);
            if line.starts_with(&last) {
                break;
            }
        }
    }

    Ok(Reply {
        code,
        text: text.trim_end().to_string(),
    })
}

fn reply_code(line: &str) -> io::Result<u16> {
    line.get(..3)
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed reply: {:?}", line.trim_end()),
            )
        })
}

/// Port from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv_port(text: &str) -> Option<u16> {
    // Skip the reply code itself.
    let body = text.get(4..)?;
    let open = body.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u16> = body[open..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .take(6)
        .map(|s| s.parse::<u16>().ok())
        .collect::<Option<_>>()?;
    match numbers[..] {
        [_, _, _, _, hi, lo] if hi < 256 && lo < 256 => Some(hi * 256 + lo),
        _ => None,
    }
}

/// Path from `257 "/some ""quoted"" dir" is current directory`.
fn parse_quoted_path(text: &str) -> Option<String> {
    let open = text.find('"')?;
    let mut path = String::new();
    let mut chars = text[open + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Some(path);
            }
        } else {
            path.push(c);
        }
    }
    None
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "FTP session is not connected")
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "control connection closed")
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}
