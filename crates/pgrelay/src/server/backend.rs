//! Backend dialing and out-of-band cancellation
//!
//! The proxy never decides where a client goes. A [`DialBackend`] supplied by
//! the host maps the client's [`StartupData`] to a [`LogicalConnection`]: a
//! byte stream to one physical backend plus a handle able to send that
//! backend a CancelRequest on a side connection.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ProxyError, Result};
use crate::protocol::postgres::codec::write_cancel_request;
use crate::protocol::postgres::{CancelData, StartupData};

/// Byte stream to a backend.
pub trait BackendStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendStream for T {}

/// Sends a CancelRequest to the backend that owns a session.
#[async_trait]
pub trait CancelBackend: Send + Sync {
    async fn cancel(&self, cancel: &CancelData) -> Result<()>;
}

/// Chooses and connects the backend for a client.
///
/// Called once per client StartupMessage, before the proxy speaks to any
/// backend. The returned connection must be a fresh, unauthenticated
/// stream; the proxy runs TLS and authentication on it itself.
///
/// [`TcpDialer`] covers the single fixed backend case.
///
/// # Example
///
/// ```ignore
/// struct PerDatabase(HashMap<String, TcpDialer>);
///
/// #[async_trait]
/// impl DialBackend for PerDatabase {
///     async fn dial(&self, startup: &StartupData) -> Result<LogicalConnection> {
///         match self.0.get(&startup.database) {
///             Some(dialer) => dialer.dial(startup).await,
///             None => Err(ProxyError::DatabaseNotFound(startup.database.clone())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait DialBackend: Send + Sync {
    /// # Errors
    ///
    /// `DatabaseNotFound` when the host has no backend for
    /// `startup.database`; connection failures and timeouts otherwise.
    async fn dial(&self, startup: &StartupData) -> Result<LogicalConnection>;
}

/// Connection to one physical backend.
///
/// Owned by the relay; the registry keeps only [`LogicalConnection::canceller`].
pub struct LogicalConnection {
    stream: Box<dyn BackendStream>,
    canceller: Arc<dyn CancelBackend>,
}

impl LogicalConnection {
    pub fn new(stream: impl BackendStream + 'static, canceller: Arc<dyn CancelBackend>) -> Self {
        Self {
            stream: Box::new(stream),
            canceller,
        }
    }

    /// Forward a cancellation to this connection's backend.
    ///
    /// The returned future owns its handle, so it can be spawned while the
    /// connection itself stays with the relay.
    pub fn cancel(
        &self,
        cancel: &CancelData,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let canceller = self.canceller();
        let cancel = *cancel;
        async move { canceller.cancel(&cancel).await }
    }

    /// Shared cancellation handle, outliving the stream if needed.
    pub fn canceller(&self) -> Arc<dyn CancelBackend> {
        Arc::clone(&self.canceller)
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection").finish_non_exhaustive()
    }
}

impl AsyncRead for LogicalConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LogicalConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

// ============================================================================
// TCP implementation
// ============================================================================

/// Dials one fixed `host:port` for every client.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    databases: Vec<String>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            databases: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Only these databases are served; an empty list serves any.
    pub fn with_databases(mut self, databases: Vec<String>) -> Self {
        self.databases = databases;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn serves(&self, database: &str) -> bool {
        self.databases.is_empty() || self.databases.iter().any(|db| db == database)
    }
}

async fn connect_tcp(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            ProxyError::Timeout(format!(
                "connecting to {} took longer than {:?}",
                address, connect_timeout
            ))
        })?
        .map_err(|e| ProxyError::Connection(format!("failed to connect to {}: {}", address, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[async_trait]
impl DialBackend for TcpDialer {
    async fn dial(&self, startup: &StartupData) -> Result<LogicalConnection> {
        if !self.serves(&startup.database) {
            return Err(ProxyError::DatabaseNotFound(startup.database.clone()));
        }

        let stream = connect_tcp(&self.address, self.connect_timeout).await?;
        debug!(
            "Connected to backend {} for {}@{}",
            self.address, startup.username, startup.database
        );

        let canceller = Arc::new(TcpCanceller {
            address: self.address.clone(),
            connect_timeout: self.connect_timeout,
        });
        Ok(LogicalConnection::new(stream, canceller))
    }
}

/// Opens a short-lived plain TCP connection carrying the 16-byte
/// CancelRequest, then closes it. The backend sends no reply.
struct TcpCanceller {
    address: String,
    connect_timeout: Duration,
}

#[async_trait]
impl CancelBackend for TcpCanceller {
    async fn cancel(&self, cancel: &CancelData) -> Result<()> {
        let mut stream = connect_tcp(&self.address, self.connect_timeout).await?;
        write_cancel_request(&mut stream, cancel).await?;
        stream.shutdown().await?;
        debug!(
            "Sent CancelRequest for pid {} to {}",
            cancel.process_id, self.address
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    struct NoopCanceller;

    #[async_trait]
    impl CancelBackend for NoopCanceller {
        async fn cancel(&self, _cancel: &CancelData) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_logical_connection_delegates_io() {
        let (a, mut b) = duplex(64);
        let mut conn = LogicalConnection::new(a, Arc::new(NoopCanceller));
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        conn.cancel(&CancelData::new(1, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dialer_rejects_unknown_database() {
        let dialer = TcpDialer::new("127.0.0.1", 1).with_databases(vec!["appdb".into()]);
        let err = dialer
            .dial(&StartupData::new("alice", "otherdb"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DatabaseNotFound(ref db) if db == "otherdb"));
    }

    #[tokio::test]
    async fn test_dialer_connects_and_cancels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpDialer::new("127.0.0.1", addr.port()).with_databases(vec!["appdb".into()]);

        let conn = dialer.dial(&StartupData::new("alice", "appdb")).await.unwrap();
        let (_session, _) = listener.accept().await.unwrap();

        let cancel_task = tokio::spawn(async move { conn.cancel(&CancelData::new(42, 99)).await });
        let (mut side, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        side.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, CancelData::new(42, 99).encode());
        cancel_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_future_outlives_connection() {
        let (a, _b) = duplex(64);
        let conn = LogicalConnection::new(a, Arc::new(NoopCanceller));
        let pending = conn.cancel(&CancelData::new(3, 4));
        drop(conn);
        tokio::spawn(pending).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dialer_connection_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = TcpDialer::new("127.0.0.1", port)
            .dial(&StartupData::new("alice", "appdb"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connection(_)));
    }
}
