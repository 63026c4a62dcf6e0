//! # kumofs-kernel
//!
//! Remote trees behind a cached file-object interface.
//!
//! A filesystem is opened on an `ftp://` root and hands out
//! [`FtpFileNode`]s. A node:
//! - Learns its type from its parent's listing, or from a single probe
//! - Keeps what it learned until a local change or an explicit refresh
//! - Follows symbolic links when asked for its type, children or content
//! - Borrows a pooled client per operation; streams keep theirs until closed

pub mod config;
pub mod ftp;
pub mod vfs;

pub use config::FtpFsConfig;
pub use ftp::{
    ClientPool, Connector, FtpClient, FtpFileNode, FtpFileSystem, FtpInputStream,
    FtpOutputStream, FtpSession, PoolStats, Reply, TcpConnector,
};
pub use vfs::{CachedAttributes, FileObject, FileType, VfsError, VfsResult};
