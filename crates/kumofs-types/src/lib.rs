//! Shared identity and entry types for kumofs.
//!
//! This crate has **no internal kumofs dependencies**. It holds the pieces
//! every layer agrees on: how a filesystem root is named, and what a remote
//! directory listing says about one file.
//!
//! # Key Types
//!
//! |-----------------------|---------------------------------------------|
//! | Type                  | Purpose                                     |
//! |-----------------------|---------------------------------------------|
//! | [`HostFileName`]      | Root identity (scheme, host, port, creds)   |
//! | [`extract_user_info`] | Split `user@` off an authority segment      |
//! | [`RemoteEntry`]       | One listing line: name, kind, size, mtime   |
//! | [`EntryKind`]         | File, directory or symbolic link            |
//! |-----------------------|---------------------------------------------|

pub mod entry;
pub mod name;

pub use entry::{EntryKind, RemoteEntry};
pub use name::{
    DEFAULT_FTP_PORT, FTP_SCHEME, HostFileName, NameError, extract_user_info, normalize_path,
};
