//! Filesystem options.
//!
//! Loaded from TOML; every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! user_dir_is_root = true
//! connect_timeout_secs = 30
//! control_timeout_secs = 60
//! data_timeout_secs = 120
//! max_connections = 4
//! max_idle = 1
//! default_port = 21
//! ```

use std::path::Path;
use std::time::Duration;

use kumofs_types::DEFAULT_FTP_PORT;
use serde::{Deserialize, Serialize};

use crate::vfs::{VfsError, VfsResult};

/// Options for one FTP-backed filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FtpFsConfig {
    /// Use passive-mode data connections. Active mode is not implemented.
    pub passive: bool,
    /// Resolve the URI path against the login directory: `ftp://host/` is
    /// the login directory itself and `ftp://host/srv` its `srv` child.
    /// When false, the URI path is absolute on the server.
    pub user_dir_is_root: bool,
    pub connect_timeout_secs: u64,
    /// How long to wait for a control-connection reply.
    pub control_timeout_secs: u64,
    /// How long a data-connection read or write may stall.
    pub data_timeout_secs: u64,
    /// Upper bound on concurrently borrowed clients.
    pub max_connections: usize,
    /// Clients kept connected between borrows; extras are disconnected.
    pub max_idle: usize,
    /// Port used when the URI omits one.
    pub default_port: u16,
    /// Password sent for anonymous logins.
    pub anonymous_password: String,
}

impl Default for FtpFsConfig {
    fn default() -> Self {
        Self {
            passive: true,
            user_dir_is_root: true,
            connect_timeout_secs: 30,
            control_timeout_secs: 60,
            data_timeout_secs: 120,
            max_connections: 4,
            max_idle: 1,
            default_port: DEFAULT_FTP_PORT,
            anonymous_password: "anonymous@".to_string(),
        }
    }
}

impl FtpFsConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> VfsResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| VfsError::config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| VfsError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> VfsResult<()> {
        if !self.passive {
            return Err(VfsError::config("active-mode data connections are not supported"));
        }
        if self.max_connections == 0 {
            return Err(VfsError::config("max_connections must be at least 1"));
        }
        if self.max_idle > self.max_connections {
            return Err(VfsError::config(format!(
                "max_idle ({}) exceeds max_connections ({})",
                self.max_idle, self.max_connections
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}
