//! Generic file-object contract.
//!
//! A [`FileObject`] is one addressable node of a virtual tree. Backends
//! implement it on a cheap, cloneable handle; all cached state lives in the
//! backend's filesystem so that two handles for the same path agree.

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::types::FileType;
use super::VfsResult;

/// Core file-object trait.
#[async_trait]
pub trait FileObject: Send + Sync + Sized {
    /// Stream returned by [`FileObject::input_stream`].
    type Reader: AsyncRead + Send + Unpin;
    /// Stream returned by [`FileObject::output_stream`].
    type Writer: AsyncWrite + Send + Unpin;

    // ========================================================================
    // Identity
    // ========================================================================

    /// Absolute path within the virtual tree (`/` for the root).
    fn path(&self) -> &str;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Type of the node; symbolic links report their target's type.
    async fn file_type(&self) -> VfsResult<FileType>;

    /// Direct children. Fails with `NotADirectory` unless this is a folder.
    async fn children(&self) -> VfsResult<Vec<Self>>;

    /// Content size in bytes.
    async fn content_size(&self) -> VfsResult<u64>;

    /// Last modification time, when the backend reports one.
    async fn last_modified(&self) -> VfsResult<Option<SystemTime>>;

    // ========================================================================
    // Structure
    // ========================================================================

    /// Create this node as a folder, including missing ancestors.
    async fn create_folder(&self) -> VfsResult<()>;

    /// Delete this file or (empty) folder. Returns false when there was
    /// nothing to delete.
    async fn delete(&self) -> VfsResult<bool>;

    /// Move this node to `dest`.
    async fn rename(&self, dest: &Self) -> VfsResult<()>;

    // ========================================================================
    // Content
    // ========================================================================

    /// Open the content for reading from the start.
    async fn input_stream(&self) -> VfsResult<Self::Reader>;

    /// Open the content for reading from `offset`.
    async fn input_stream_at(&self, offset: u64) -> VfsResult<Self::Reader>;

    /// Open the content for writing, replacing it unless `append` is set.
    async fn output_stream(&self, append: bool) -> VfsResult<Self::Writer>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Forget cached type and children so the next query asks the backend.
    fn refresh(&self);

    /// Release all cached state for this node.
    fn detach(&self);

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if the node exists.
    async fn exists(&self) -> VfsResult<bool> {
        Ok(self.file_type().await?.exists())
    }
}
