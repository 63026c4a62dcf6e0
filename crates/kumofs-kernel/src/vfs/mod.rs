//! Virtual Filesystem abstraction.
//!
//! Key components:
//!
//! - [`FileObject`] - Contract every cached file node implements
//! - [`FileType`] - What a node is, with links already followed
//! - [`CachedAttributes`] - Per-node cache slot (not loaded / missing / entry)
//! - [`VfsError`] - One error type for every layer
//!
//! ## Design Decisions
//!
//! - **Nodes are handles**: a node is a path plus its filesystem; cached
//!   state lives in the filesystem under one lock, so every handle for the
//!   same path sees the same cache.
//! - **Stale until refreshed**: cached attributes are only invalidated by
//!   local mutations or an explicit refresh.

mod error;
mod ops;
mod types;

pub use error::{VfsError, VfsResult};
pub use ops::FileObject;
pub use types::{CachedAttributes, FileType};
