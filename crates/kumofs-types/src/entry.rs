//! Remote directory entries.
//!
//! A [`RemoteEntry`] is what one line of a server listing says about a
//! file: its name (as listed, not a full path), its kind, size, timestamp
//! and, for symbolic links, the raw link target.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Kind of a listed entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One entry reported by a remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Entry name as the server reported it.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 when the server does not say).
    pub size: u64,
    /// Last modification time, if the listing carried one.
    pub modified: Option<SystemTime>,
    /// Raw target of a symbolic link, unresolved.
    pub link_target: Option<String>,
}

impl RemoteEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            modified: None,
            link_target: None,
        }
    }

    /// A regular file entry.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            size,
            ..Self::new(name, EntryKind::File)
        }
    }

    /// A directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, EntryKind::Directory)
    }

    /// A symbolic link entry pointing at `target`.
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            link_target: Some(target.into()),
            ..Self::new(name, EntryKind::Symlink)
        }
    }

    /// Set the modification time.
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// `.` and `..` pseudo-entries some servers include in listings.
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}
