//! Core VFS types.

use kumofs_types::RemoteEntry;
use serde::{Deserialize, Serialize};

/// Type of a node as seen through the VFS.
///
/// Symbolic links never surface here: a link reports the type of whatever
/// it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Folder,
    /// Does not exist (yet).
    Imaginary,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_folder(&self) -> bool {
        matches!(self, FileType::Folder)
    }

    /// Returns true unless the node is imaginary.
    pub fn exists(&self) -> bool {
        !matches!(self, FileType::Imaginary)
    }
}

/// Cached knowledge about one node.
///
/// `NotLoaded` only before the first query (or after invalidation);
/// `NotExisting` is a definite answer, not a miss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CachedAttributes {
    #[default]
    NotLoaded,
    NotExisting,
    Existing(RemoteEntry),
}

impl CachedAttributes {
    pub fn is_loaded(&self) -> bool {
        !matches!(self, CachedAttributes::NotLoaded)
    }

    /// The entry, when the node is known to exist.
    pub fn entry(&self) -> Option<&RemoteEntry> {
        match self {
            CachedAttributes::Existing(entry) => Some(entry),
            _ => None,
        }
    }

    /// True when the node is a known symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.entry().is_some_and(RemoteEntry::is_symlink)
    }
}

impl From<Option<RemoteEntry>> for CachedAttributes {
    fn from(entry: Option<RemoteEntry>) -> Self {
        match entry {
            Some(entry) => CachedAttributes::Existing(entry),
            None => CachedAttributes::NotExisting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type() {
        assert!(FileType::File.is_file());
        assert!(!FileType::File.is_folder());
        assert!(FileType::Folder.is_folder());
        assert!(!FileType::Imaginary.exists());
        assert_eq!(FileType::Folder.to_string(), "folder");
    }

    #[test]
    fn test_cached_attributes() {
        let attrs = CachedAttributes::default();
        assert!(!attrs.is_loaded());
        assert!(attrs.entry().is_none());

        let attrs = CachedAttributes::from(None);
        assert_eq!(attrs, CachedAttributes::NotExisting);
        assert!(attrs.is_loaded());

        let attrs = CachedAttributes::from(Some(RemoteEntry::symlink("l", "t")));
        assert!(attrs.is_symlink());
        assert_eq!(attrs.entry().map(|e| e.name.as_str()), Some("l"));
    }
}
