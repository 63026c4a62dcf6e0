//! FTP backend.
//!
//! Layers, bottom up:
//!
//! - [`session`] - the protocol seam ([`FtpSession`], [`Connector`])
//! - [`wire`] - passive-mode sessions over TCP
//! - [`listing`] - Unix and DOS `LIST` line parsing
//! - [`client`] - one reconnecting client with the existence probe
//! - [`pool`] - bounded client borrowing
//! - [`FtpFileSystem`] / [`FtpFileNode`] - the cached file tree
//!
//! ## Failure model
//!
//! Server refusals are answers: the reply text travels in the error or is
//! turned into "does not exist". Transport failures get one reconnect and
//! one retry per operation, then surface as [`VfsError::Transport`].
//!
//! [`VfsError::Transport`]: crate::vfs::VfsError::Transport

pub mod client;
mod filesystem;
pub mod listing;
#[cfg(any(test, feature = "test-mock"))]
pub mod mock;
mod node;
pub mod pool;
pub mod session;
mod stream;
pub mod wire;

pub use client::FtpClient;
pub use filesystem::FtpFileSystem;
pub use node::{FtpFileNode, MAX_LINK_HOPS};
pub use pool::{ClientPool, PoolStats, PooledClient};
pub use session::{Connector, DataReader, DataWriter, FtpSession, Reply};
pub use stream::{FtpInputStream, FtpOutputStream};
pub use wire::{TcpConnector, WireSession};
