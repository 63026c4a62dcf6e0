//! Content streams bound to a borrowed client.
//!
//! A stream holds its [`PooledClient`] for its whole life, since the control
//! connection owes a final transfer reply until the data connection is
//! closed. `close()` collects that reply and always gives the client back;
//! dropping a stream without closing it discards the session instead, as
//! nobody is left to read the reply.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::node::FtpFileNode;
use super::pool::PooledClient;
use super::session::{DataReader, DataWriter};
use crate::vfs::{FileObject, VfsError, VfsResult};

/// Download stream.
pub struct FtpInputStream {
    client: Option<PooledClient>,
    reader: Option<DataReader>,
    path: String,
}

impl FtpInputStream {
    pub(crate) fn new(client: PooledClient, reader: DataReader, path: String) -> Self {
        Self {
            client: Some(client),
            reader: Some(reader),
            path,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the data connection and confirm the transfer.
    pub async fn close(mut self) -> VfsResult<()> {
        self.reader = None;
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        finish(client, "retrieve", &self.path).await
    }

    /// Drop the connection without reading the transfer reply.
    pub fn abort(mut self) {
        self.reader = None;
        if let Some(mut client) = self.client.take() {
            client.abort();
        }
    }
}

impl AsyncRead for FtpInputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for FtpInputStream {
    fn drop(&mut self) {
        if let Some(mut client) = self.client.take() {
            tracing::debug!(path = %self.path, "input stream dropped unclosed, discarding session");
            self.reader = None;
            client.abort();
        }
    }
}

/// Upload stream. Closing it invalidates the cached state of the node it
/// writes.
pub struct FtpOutputStream {
    client: Option<PooledClient>,
    writer: Option<DataWriter>,
    node: Option<FtpFileNode>,
}

impl FtpOutputStream {
    pub(crate) fn new(client: PooledClient, writer: DataWriter, node: FtpFileNode) -> Self {
        Self {
            client: Some(client),
            writer: Some(writer),
            node: Some(node),
        }
    }

    pub fn path(&self) -> &str {
        self.node.as_ref().map(|n| n.path()).unwrap_or_default()
    }

    /// Flush and close the data connection, then confirm the transfer.
    pub async fn close(mut self) -> VfsResult<()> {
        let shutdown = match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };
        let path = self.path().to_string();
        let finished = match self.client.take() {
            Some(client) => finish(client, "store", &path).await,
            None => Ok(()),
        };
        if let Some(node) = self.node.take() {
            node.content_changed();
        }
        shutdown?;
        finished
    }

    /// Drop the connection without reading the transfer reply.
    pub fn abort(mut self) {
        self.writer = None;
        if let Some(mut client) = self.client.take() {
            client.abort();
        }
        if let Some(node) = self.node.take() {
            node.content_changed();
        }
    }

    fn writer(&mut self) -> io::Result<&mut DataWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream is closed"))
    }
}

impl AsyncWrite for FtpOutputStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for FtpOutputStream {
    fn drop(&mut self) {
        if let Some(mut client) = self.client.take() {
            tracing::debug!(path = %self.path(), "output stream dropped unclosed, discarding session");
            self.writer = None;
            client.abort();
        }
        if let Some(node) = self.node.take() {
            node.content_changed();
        }
    }
}

/// Read the transfer's final reply and give the client back, whatever the
/// outcome.
async fn finish(mut client: PooledClient, op: &'static str, path: &str) -> VfsResult<()> {
    let completed = client.complete_pending_command().await;
    let reply = client.reply_string();
    drop(client);
    match completed? {
        true => Ok(()),
        false => Err(VfsError::StreamFinalization {
            op,
            path: path.to_string(),
            reply,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::mock::MockServer;
    use crate::ftp::pool::ClientPool;
    use kumofs_types::HostFileName;
    use tokio::io::AsyncReadExt;

    async fn open(server: &MockServer, pool: &ClientPool) -> FtpInputStream {
        let mut client = pool.acquire().await.unwrap();
        let reader = client
            .retrieve_file_stream("data.bin", None)
            .await
            .unwrap()
            .unwrap();
        assert!(server.count_commands("RETR") >= 1);
        FtpInputStream::new(client, reader, "/data.bin".into())
    }

    fn setup() -> (MockServer, ClientPool) {
        let server = MockServer::new();
        server.add_file("/data.bin", b"0123456789");
        let pool = ClientPool::new(
            HostFileName::parse_ftp("ftp://mock/").unwrap(),
            server.connector(),
            1,
            1,
        );
        (server, pool)
    }

    #[tokio::test]
    async fn test_close_returns_client_once() {
        let (server, pool) = setup();
        let mut stream = open(&server, &pool).await;

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"0123456789");
        stream.close().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_negative_completion_still_releases() {
        let (server, pool) = setup();
        let stream = open(&server, &pool).await;

        server.fail_completion(true);
        let err = stream.close().await.unwrap_err();
        assert!(matches!(
            err,
            VfsError::StreamFinalization { op: "retrieve", ref reply, .. } if reply.starts_with("451")
        ));
        assert_eq!(pool.stats().released, 1);
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_completion_error_still_releases() {
        let (server, pool) = setup();
        let stream = open(&server, &pool).await;

        server.fail_next(1);
        assert!(matches!(stream.close().await, Err(VfsError::Io(_))));
        let stats = pool.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn test_drop_and_abort_discard_session() {
        let (server, pool) = setup();

        drop(open(&server, &pool).await);
        assert_eq!(pool.stats().released, 1);
        assert_eq!(pool.stats().idle, 0);

        open(&server, &pool).await.abort();
        assert_eq!(pool.stats().released, 2);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(server.connect_count(), 2);
    }
}
