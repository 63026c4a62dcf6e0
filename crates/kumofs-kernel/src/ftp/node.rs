//! Cached file nodes.
//!
//! An [`FtpFileNode`] is a virtual path plus its filesystem. What the node
//! knows (attributes, children, link target) lives in the filesystem's
//! cache region, so every handle for a path shares it.
//!
//! ## Attribute loading
//!
//! A node never lists itself to learn its own type. It asks its parent for
//! the entry under its base name: the parent answers from its children map
//! when it has listed already, otherwise the adapter probes the one path.
//! The root is assumed to be an existing folder.
//!
//! ## Invalidation
//!
//! Nothing expires on its own. Local mutations invalidate the node and
//! notify the parent: a deletion drops one entry from the parent's
//! children map, anything else drops the whole map since new names cannot
//! be predicted. [`FileObject::refresh`] forgets the node's own state and
//! makes the next load bypass the parent's map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use kumofs_types::{RemoteEntry, normalize_path};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::filesystem::{FtpFileSystem, NodeState};
use super::stream::{FtpInputStream, FtpOutputStream};
use crate::vfs::{CachedAttributes, FileObject, FileType, VfsError, VfsResult};

/// Symbolic links followed before giving up.
pub const MAX_LINK_HOPS: usize = 16;

/// How a child changed, as reported to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildChange {
    Deleted,
    Changed,
}

/// One path in an FTP tree.
#[derive(Clone)]
pub struct FtpFileNode {
    fs: Arc<FtpFileSystem>,
    path: String,
}

impl FtpFileNode {
    pub(crate) fn new(fs: Arc<FtpFileSystem>, path: String) -> Self {
        Self { fs, path }
    }

    pub fn filesystem(&self) -> &Arc<FtpFileSystem> {
        &self.fs
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Last path segment; empty for the root.
    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let parent = match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(slash) => &self.path[..slash],
        };
        Some(Self::new(Arc::clone(&self.fs), parent.to_string()))
    }

    /// Direct child called `name`.
    pub fn child(&self, name: &str) -> VfsResult<Self> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::invalid_path(name));
        }
        Ok(Self::new(Arc::clone(&self.fs), join(&self.path, name)))
    }

    /// Cached attributes, without loading anything.
    pub fn cached_attributes(&self) -> CachedAttributes {
        self.fs
            .peek_state(&self.path, |s| s.info.clone())
            .unwrap_or_default()
    }

    /// Names in the cached children map; `None` when not listed.
    pub fn cached_child_names(&self) -> Option<Vec<String>> {
        self.fs
            .peek_state(&self.path, |s| s.children.as_ref().map(|c| c.keys().cloned().collect()))
            .flatten()
    }

    /// Read the whole content.
    pub async fn read_to_end(&self) -> VfsResult<Vec<u8>> {
        let mut stream = self.input_stream().await?;
        let mut data = Vec::new();
        if let Err(e) = stream.read_to_end(&mut data).await {
            stream.abort();
            return Err(e.into());
        }
        stream.close().await?;
        Ok(data)
    }

    /// Replace the content with `data`.
    pub async fn write_all(&self, data: &[u8]) -> VfsResult<()> {
        let mut stream = self.output_stream(false).await?;
        if let Err(e) = stream.write_all(data).await {
            stream.abort();
            return Err(e.into());
        }
        stream.close().await
    }

    fn remote_path(&self) -> String {
        self.fs.remote_path(&self.path)
    }

    async fn info(&self) -> VfsResult<CachedAttributes> {
        let (cached, flush) = self
            .fs
            .peek_state(&self.path, |s| (s.info.clone(), s.needs_flush))
            .unwrap_or_default();
        if cached.is_loaded() {
            return Ok(cached);
        }

        let loaded = match self.parent() {
            None => CachedAttributes::Existing(RemoteEntry::directory("")),
            Some(parent) => parent.child_entry(self.base_name(), flush).await?.into(),
        };
        self.fs.with_state(&self.path, |s| {
            s.info = loaded.clone();
            s.needs_flush = false;
        });
        Ok(loaded)
    }

    /// Entry for child `name`, from the children map when listed.
    async fn child_entry(&self, name: &str, flush: bool) -> VfsResult<Option<RemoteEntry>> {
        let listed = self
            .fs
            .update_state(&self.path, |s| {
                if flush && !s.in_refresh {
                    s.children = None;
                }
                s.children.as_ref().map(|c| c.get(name).cloned())
            })
            .flatten();
        if let Some(entry) = listed {
            return Ok(entry);
        }

        let remote = self.fs.remote_path(&join(&self.path, name));
        let mut client = self.fs.client().await?;
        client.get_file_or_directory(&remote).await
    }

    /// Follow symbolic links to the node they end at, with its attributes.
    /// A dangling link ends at itself, reported as not existing.
    async fn resolve_links(&self) -> VfsResult<(Self, CachedAttributes)> {
        let mut node = self.clone();
        let mut hops = 0;
        loop {
            let info = node.info().await?;
            if !info.is_symlink() {
                return Ok((node, info));
            }
            if hops == MAX_LINK_HOPS {
                return Err(VfsError::TooManySymlinks(self.path.clone()));
            }
            hops += 1;
            match node.link_destination()? {
                Some(next) => node = next,
                None => return Ok((node, CachedAttributes::NotExisting)),
            }
        }
    }

    /// Link target resolved against the link's parent; computed once.
    fn link_destination(&self) -> VfsResult<Option<Self>> {
        let (cached, target) = self
            .fs
            .peek_state(&self.path, |s| {
                (
                    s.link_destination.clone(),
                    s.info.entry().and_then(|e| e.link_target.clone()),
                )
            })
            .unwrap_or_default();
        if let Some(dest) = cached {
            return Ok(Some(Self::new(Arc::clone(&self.fs), dest)));
        }
        let Some(target) = target else {
            return Ok(None);
        };

        let joined = match self.parent() {
            Some(parent) if !target.starts_with('/') => join(&parent.path, &target),
            _ => target,
        };
        let dest = normalize_path(&joined)?;
        self.fs
            .update_state(&self.path, |s| s.link_destination = Some(dest.clone()));
        Ok(Some(Self::new(Arc::clone(&self.fs), dest)))
    }

    /// This folder's children map, listing it if needed.
    async fn list_children(&self) -> VfsResult<BTreeMap<String, RemoteEntry>> {
        if let Some(children) = self.fs.peek_state(&self.path, |s| s.children.clone()).flatten() {
            return Ok(children);
        }

        self.fs.with_state(&self.path, |s| s.in_refresh = true);
        let listed = async {
            let mut client = self.fs.client().await?;
            client.list(&self.remote_path()).await
        }
        .await;
        self.fs.with_state(&self.path, |s| s.in_refresh = false);

        let children = index_children(listed?.unwrap_or_default());
        tracing::debug!(path = %self.path, count = children.len(), "listed children");
        self.fs
            .with_state(&self.path, |s| s.children = Some(children.clone()));
        Ok(children)
    }

    /// After a structural change that succeeded: the node is now `info` and
    /// has no children.
    fn invalidate(&self, info: CachedAttributes) {
        self.fs.with_state(&self.path, |s| {
            s.info = info;
            s.children = Some(BTreeMap::new());
            s.link_destination = None;
            s.needs_flush = false;
        });
    }

    /// Forget everything known about the node.
    fn reset(&self) {
        self.fs.update_state(&self.path, |s| {
            s.info = CachedAttributes::NotLoaded;
            s.children = None;
            s.link_destination = None;
        });
    }

    /// Apply `change` to the parent's children map. When the parent is a
    /// link, the folders it leads to hold the map, and the same child
    /// under them is forgotten.
    fn notify_parent(&self, change: ChildChange) {
        let Some(mut parent) = self.parent() else {
            return;
        };
        let name = self.base_name();
        for _ in 0..=MAX_LINK_HOPS {
            self.fs.update_state(&parent.path, |s| match change {
                ChildChange::Deleted => {
                    if let Some(children) = s.children.as_mut() {
                        children.remove(name);
                    }
                }
                ChildChange::Changed => s.children = None,
            });
            let Ok(Some(next)) = parent.link_destination() else {
                return;
            };
            let alias = join(&next.path, name);
            if alias != self.path {
                self.fs.forget_descendants(&alias);
                self.fs.forget(&alias);
            }
            parent = next;
        }
    }

    /// Content was (or may have been) written.
    pub(crate) fn content_changed(&self) {
        self.reset();
        self.notify_parent(ChildChange::Changed);
    }

    async fn existing_entry(&self) -> VfsResult<RemoteEntry> {
        let (_, info) = self.resolve_links().await?;
        match info {
            CachedAttributes::Existing(entry) => Ok(entry),
            _ => Err(VfsError::not_found(&self.path)),
        }
    }
}

#[async_trait]
impl FileObject for FtpFileNode {
    type Reader = FtpInputStream;
    type Writer = FtpOutputStream;

    fn path(&self) -> &str {
        &self.path
    }

    async fn file_type(&self) -> VfsResult<FileType> {
        let (_, info) = self.resolve_links().await?;
        Ok(match info.entry() {
            None => FileType::Imaginary,
            Some(entry) if entry.is_dir() => FileType::Folder,
            Some(_) => FileType::File,
        })
    }

    async fn children(&self) -> VfsResult<Vec<Self>> {
        let (target, info) = self.resolve_links().await?;
        if !info.entry().is_some_and(RemoteEntry::is_dir) {
            return Err(VfsError::not_a_directory(&self.path));
        }

        let listing = target.list_children().await?;
        let children = listing
            .into_iter()
            .map(|(name, entry)| {
                let child = Self::new(Arc::clone(&self.fs), join(&target.path, &name));
                self.fs.with_state(&child.path, |s| {
                    s.info = CachedAttributes::Existing(entry);
                    s.link_destination = None;
                    s.needs_flush = false;
                });
                child
            })
            .collect();
        Ok(children)
    }

    async fn content_size(&self) -> VfsResult<u64> {
        Ok(self.existing_entry().await?.size)
    }

    async fn last_modified(&self) -> VfsResult<Option<SystemTime>> {
        Ok(self.existing_entry().await?.modified)
    }

    async fn create_folder(&self) -> VfsResult<()> {
        match self.file_type().await? {
            FileType::Folder => return Ok(()),
            FileType::File => return Err(VfsError::already_exists(&self.path)),
            FileType::Imaginary => {}
        }
        if let Some(parent) = self.parent() {
            parent.create_folder().await?;
        }

        let mut client = self.fs.client().await?;
        let made = client.make_directory(&self.remote_path()).await;
        let reply = client.reply_string();
        drop(client);

        self.notify_parent(ChildChange::Changed);
        match made {
            Ok(true) => {
                self.invalidate(CachedAttributes::NotLoaded);
                Ok(())
            }
            Ok(false) => {
                self.reset();
                Err(VfsError::operation_failed("create_folder", &self.path, reply))
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn delete(&self) -> VfsResult<bool> {
        if self.is_root() {
            return Err(VfsError::invalid_path("cannot delete the root"));
        }
        let info = self.info().await?;
        let Some(entry) = info.entry() else {
            return Ok(false);
        };

        let remote = self.remote_path();
        let mut client = self.fs.client().await?;
        let deleted = if entry.is_dir() {
            client.remove_directory(&remote).await
        } else {
            client.delete_file(&remote).await
        };
        let reply = client.reply_string();
        drop(client);

        match deleted {
            Ok(true) => {
                self.fs.forget_descendants(&self.path);
                self.invalidate(CachedAttributes::NotExisting);
                self.notify_parent(ChildChange::Deleted);
                Ok(true)
            }
            other => {
                self.reset();
                self.notify_parent(ChildChange::Changed);
                match other {
                    Err(e) => Err(e),
                    Ok(_) => Err(VfsError::operation_failed("delete", &self.path, reply)),
                }
            }
        }
    }

    async fn rename(&self, dest: &Self) -> VfsResult<()> {
        if !Arc::ptr_eq(&self.fs, &dest.fs) {
            return Err(VfsError::invalid_path(format!(
                "{} is on another filesystem",
                dest.path
            )));
        }
        if self.is_root() || dest.is_root() {
            return Err(VfsError::invalid_path("cannot rename the root"));
        }
        if !self.exists().await? {
            return Err(VfsError::not_found(&self.path));
        }

        let mut client = self.fs.client().await?;
        let renamed = client.rename(&self.remote_path(), &dest.remote_path()).await;
        let reply = client.reply_string();
        drop(client);

        self.fs.forget_descendants(&dest.path);
        dest.reset();
        dest.notify_parent(ChildChange::Changed);
        match renamed {
            Ok(true) => {
                self.fs.forget_descendants(&self.path);
                self.invalidate(CachedAttributes::NotLoaded);
                self.notify_parent(ChildChange::Deleted);
                Ok(())
            }
            other => {
                self.reset();
                self.notify_parent(ChildChange::Changed);
                match other {
                    Err(e) => Err(e),
                    Ok(_) => Err(VfsError::operation_failed("rename", &self.path, reply)),
                }
            }
        }
    }

    async fn input_stream(&self) -> VfsResult<FtpInputStream> {
        self.input_stream_at(0).await
    }

    async fn input_stream_at(&self, offset: u64) -> VfsResult<FtpInputStream> {
        let (target, info) = self.resolve_links().await?;
        match info.entry() {
            None => return Err(VfsError::not_found(&self.path)),
            Some(entry) if entry.is_dir() => {
                return Err(VfsError::operation_failed("retrieve", &self.path, "is a folder"));
            }
            Some(_) => {}
        }

        let mut client = self.fs.client().await?;
        let restart = (offset > 0).then_some(offset);
        let opened = client
            .retrieve_file_stream(&target.remote_path(), restart)
            .await?;
        match opened {
            Some(reader) => Ok(FtpInputStream::new(client, reader, self.path.clone())),
            None => Err(VfsError::operation_failed(
                "retrieve",
                &self.path,
                client.reply_string(),
            )),
        }
    }

    async fn output_stream(&self, append: bool) -> VfsResult<FtpOutputStream> {
        let remote = self.remote_path();
        let mut client = self.fs.client().await?;
        let opened = if append {
            client.append_file_stream(&remote).await
        } else {
            client.store_file_stream(&remote).await
        };
        match opened {
            Ok(Some(writer)) => Ok(FtpOutputStream::new(client, writer, self.clone())),
            Ok(None) => {
                let reply = client.reply_string();
                drop(client);
                self.content_changed();
                let op = if append { "append" } else { "store" };
                Err(VfsError::operation_failed(op, &self.path, reply))
            }
            Err(e) => {
                drop(client);
                self.content_changed();
                Err(e)
            }
        }
    }

    fn refresh(&self) {
        // State is only created when a parent's map could answer the next load.
        let parent_listed = self
            .parent()
            .and_then(|p| self.fs.peek_state(&p.path, |s| s.children.is_some()))
            .unwrap_or(false);
        let suppressed = if parent_listed {
            Some(self.fs.with_state(&self.path, forget_loaded))
        } else {
            self.fs.update_state(&self.path, forget_loaded)
        };
        if suppressed == Some(true) {
            tracing::trace!(path = %self.path, "refresh suppressed during listing");
        }
    }

    fn detach(&self) {
        self.fs.forget(&self.path);
    }
}

impl PartialEq for FtpFileNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fs, &other.fs) && self.path == other.path
    }
}

impl Eq for FtpFileNode {}

impl std::fmt::Debug for FtpFileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FtpFileNode({}{})", self.fs.root().root_uri(), self.path.trim_start_matches('/'))
    }
}

/// Drop loaded state and flag the next load to bypass the parent's map.
/// Returns true, changing nothing, while a listing is in flight.
fn forget_loaded(s: &mut NodeState) -> bool {
    if s.in_refresh {
        return true;
    }
    s.info = CachedAttributes::NotLoaded;
    s.children = None;
    s.link_destination = None;
    s.needs_flush = true;
    false
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Children map from a listing: unnamed and dot entries dropped, later
/// duplicates replacing earlier ones.
fn index_children(listing: Vec<RemoteEntry>) -> BTreeMap<String, RemoteEntry> {
    listing
        .into_iter()
        .filter(|entry| !entry.name.is_empty() && !entry.is_dot_entry())
        .map(|entry| (entry.name.clone(), entry))
        .collect()
}
