//! Client pool.
//!
//! Borrowing waits on a semaphore sized by `max_connections`. A
//! [`PooledClient`] hands its client back when dropped, so release happens
//! on every exit path. Connected clients are kept idle up to `max_idle`;
//! the rest are logged out in the background.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kumofs_types::HostFileName;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::client::FtpClient;
use super::session::Connector;
use crate::vfs::{VfsError, VfsResult};

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Clients connected by the pool (not counting seeded ones).
    pub created: usize,
    /// Borrows handed back.
    pub released: usize,
    /// Clients currently idle.
    pub idle: usize,
    /// Borrows that could start right now without waiting.
    pub available: usize,
}

struct PoolInner {
    root: HostFileName,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<FtpClient>>,
    max_idle: usize,
    created: AtomicUsize,
    released: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn release(&self, mut client: FtpClient) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if !client.is_connected() {
            return;
        }
        if !self.closed.load(Ordering::Acquire) {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(client);
                return;
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { client.disconnect().await });
            }
            Err(_) => {
                client.abort();
            }
        }
    }
}

/// Pool of [`FtpClient`]s for one root.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(
        root: HostFileName,
        connector: Arc<dyn Connector>,
        max_connections: usize,
        max_idle: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                root,
                connector,
                permits: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::new()),
                max_idle,
                created: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Park an already connected client for the next borrower.
    pub fn seed(&self, client: FtpClient) {
        self.inner.idle.lock().push(client);
    }

    /// Borrow a client, waiting for a free slot. Reuses an idle client when
    /// there is one, otherwise connects a new one.
    pub async fn acquire(&self) -> VfsResult<PooledClient> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| VfsError::PoolClosed)?;

        let idle = self.inner.idle.lock().pop();
        let client = match idle {
            Some(client) => client,
            None => {
                let client =
                    FtpClient::connect(self.inner.root.clone(), Arc::clone(&self.inner.connector))
                        .await?;
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(root = %self.inner.root, "pool opened a connection");
                client
            }
        };

        Ok(PooledClient {
            client,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
            available: self.inner.permits.available_permits(),
        }
    }

    /// Refuse further borrows and log out idle clients. Borrowed clients are
    /// logged out as they come back.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock());
        for mut client in idle {
            client.disconnect().await;
        }
    }
}

/// A borrowed client; derefs to [`FtpClient`] and returns it on drop.
pub struct PooledClient {
    client: FtpClient,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = FtpClient;

    fn deref(&self) -> &FtpClient {
        &self.client
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut FtpClient {
        &mut self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        // The permit is released after this body, so the client is back in
        // the idle list before a waiter can look for it.
        let client = self.client.take();
        self.pool.release(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::mock::MockServer;
    use std::time::Duration;

    fn pool(server: &MockServer, max_connections: usize, max_idle: usize) -> ClientPool {
        ClientPool::new(
            HostFileName::parse_ftp("ftp://mock/").unwrap(),
            server.connector(),
            max_connections,
            max_idle,
        )
    }

    #[tokio::test]
    async fn test_idle_client_is_reused() {
        let server = MockServer::new();
        let pool = pool(&server, 2, 1);

        let client = pool.acquire().await.unwrap();
        assert!(client.is_connected());
        drop(client);
        let client = pool.acquire().await.unwrap();
        drop(client);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_extra_clients_beyond_max_idle_are_dropped() {
        let server = MockServer::new();
        let pool = pool(&server, 3, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().available, 1);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().available, 3);
    }

    #[tokio::test]
    async fn test_broken_clients_are_not_kept() {
        let server = MockServer::new();
        let pool = pool(&server, 1, 1);

        let mut client = pool.acquire().await.unwrap();
        client.abort();
        drop(client);
        assert_eq!(pool.stats().idle, 0);

        let client = pool.acquire().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let server = MockServer::new();
        let pool = pool(&server, 1, 1);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let server = MockServer::new();
        let pool = pool(&server, 1, 1);
        drop(pool.acquire().await.unwrap());

        pool.close().await;
        assert!(matches!(pool.acquire().await, Err(VfsError::PoolClosed)));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(server.count_commands("QUIT"), 1);
    }
}
