//! Connection-string parsing.
//!
//! A filesystem root is addressed as
//! `scheme://[user[:password]@]host[:port][/path]`. [`extract_user_info`] is
//! the exact contract the protocol layer depends on: it splits the raw
//! user-info token off the authority without decoding it, so an escaped
//! `%40` inside a user name survives until [`HostFileName::parse`] decodes it.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme handled by the FTP adapter.
pub const FTP_SCHEME: &str = "ftp";

/// Port substituted when an FTP URI names none.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Bytes escaped when a user name is written back into a URI.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'@')
    .add(b':')
    .add(b'/')
    .add(b'?')
    .add(b'#');

/// Errors from parsing a connection string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),

    #[error("missing host in {0:?}")]
    MissingHost(String),

    #[error("invalid port {port:?} in {uri:?}")]
    InvalidPort { uri: String, port: String },

    #[error("invalid percent-encoding in {0:?}")]
    InvalidEncoding(String),

    #[error("path escapes root: {0}")]
    InvalidPath(String),
}

/// Split the user-info token off the front of `buffer`.
///
/// Only the authority segment (everything before the first `/`) is scanned,
/// and the *last* raw `@` in it is the separator. Returns the token and the
/// remaining `host[:port][/path]`; when no `@` qualifies, returns `None` and
/// the buffer untouched.
///
/// ```
/// use kumofs_types::extract_user_info;
///
/// assert_eq!(
///     extract_user_info("mio%40ashish@192.168.100.141:21/"),
///     (Some("mio%40ashish"), "192.168.100.141:21/"),
/// );
/// assert_eq!(extract_user_info(""), (None, ""));
/// ```
pub fn extract_user_info(buffer: &str) -> (Option<&str>, &str) {
    let authority_end = buffer.find('/').unwrap_or(buffer.len());
    match buffer[..authority_end].rfind('@') {
        Some(at) => (Some(&buffer[..at]), &buffer[at + 1..]),
        None => (None, buffer),
    }
}

/// Normalize an absolute path: collapse repeated `/`, drop `.`, resolve `..`.
///
/// The result always starts with `/` and never ends with one (except the
/// root itself). Climbing above the root is an error.
pub fn normalize_path(path: &str) -> Result<String, NameError> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(NameError::InvalidPath(path.to_string()));
                }
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Identity of a filesystem root on a remote host.
///
/// Immutable once parsed. The port is always concrete: when the URI omits
/// it, the parser stores the scheme's default.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostFileName {
    scheme: String,
    host: String,
    port: u16,
    default_port: u16,
    user: Option<String>,
    password: Option<String>,
    path: String,
}

impl HostFileName {
    /// Parse `scheme://[user[:password]@]host[:port][/path]`.
    pub fn parse(uri: &str, default_port: u16) -> Result<Self, NameError> {
        let (scheme, rest) = uri
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| NameError::MissingScheme(uri.to_string()))?;

        let (user_info, rest) = extract_user_info(rest);
        let (user, password) = match user_info {
            Some(info) => {
                let (user, password) = match info.split_once(':') {
                    Some((user, password)) => (user, Some(password)),
                    None => (info, None),
                };
                let user = Some(decode(user, uri)?).filter(|u| !u.is_empty());
                let password = password.map(|p| decode(p, uri)).transpose()?;
                (user, password)
            }
            None => (None, None),
        };

        let authority_end = rest.find('/').unwrap_or(rest.len());
        let (authority, path) = rest.split_at(authority_end);
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(NameError::MissingHost(uri.to_string()));
        }

        let port = match port {
            None | Some("") => default_port,
            Some(digits) => digits.parse::<u16>().map_err(|_| NameError::InvalidPort {
                uri: uri.to_string(),
                port: digits.to_string(),
            })?,
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            default_port,
            user,
            password,
            path: normalize_path(path)?,
        })
    }

    /// Parse an `ftp://` URI with port 21 as default.
    pub fn parse_ftp(uri: &str) -> Result<Self, NameError> {
        Self::parse(uri, DEFAULT_FTP_PORT)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Decoded user name, if the URI carried one.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Decoded password, if the URI carried one.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Base path of the root on the server (`/` when absent).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `scheme://[user@]host[:port]/`, omitting the port when it is the default.
    pub fn root_uri(&self) -> String {
        let mut uri = format!("{}://", self.scheme);
        if let Some(user) = &self.user {
            uri.push_str(&encode_user(user));
            uri.push('@');
        }
        uri.push_str(&self.host);
        if self.port != self.default_port {
            uri.push_str(&format!(":{}", self.port));
        }
        uri.push('/');
        uri
    }
}

fn encode_user(user: &str) -> String {
    utf8_percent_encode(user, USERINFO).to_string()
}

fn decode(raw: &str, uri: &str) -> Result<String, NameError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| NameError::InvalidEncoding(uri.to_string()))
}

impl fmt::Display for HostFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        match (&self.user, &self.password) {
            (Some(user), Some(_)) => write!(f, "{}:***@", encode_user(user))?,
            (Some(user), None) => write!(f, "{}@", encode_user(user))?,
            (None, _) => {}
        }
        write!(f, "{}", self.host)?;
        if self.port != self.default_port {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "{}", self.path)
    }
}

// Debug goes through Display so passwords never reach logs.
impl fmt::Debug for HostFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFileName({self})")
    }
}
