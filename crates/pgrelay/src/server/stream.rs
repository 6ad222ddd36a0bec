//! Transport that is either plain or TLS, decided during the handshake
//!
//! PostgreSQL upgrades to TLS in-band after an SSLRequest, so the same
//! connection starts as `Plain` and may become `ServerTls` (client leg) or
//! `ClientTls` (backend leg). The type is generic over the underlying stream
//! so the handshake code runs the same over `TcpStream` and in-memory pipes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

/// Plain or TLS-wrapped stream. TLS variants are boxed; they are much larger
/// than the plain one.
pub enum NetworkStream<S = TcpStream> {
    Plain(S),
    /// TLS terminated by the proxy (client leg)
    ServerTls(Box<ServerTlsStream<S>>),
    /// TLS initiated by the proxy (backend leg)
    ClientTls(Box<ClientTlsStream<S>>),
}

impl<S> NetworkStream<S> {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, NetworkStream::Plain(_))
    }

    /// Negotiated protocol version, for logging.
    pub fn tls_version(&self) -> Option<&'static str> {
        let version = match self {
            NetworkStream::Plain(_) => return None,
            NetworkStream::ServerTls(tls) => tls.get_ref().1.protocol_version(),
            NetworkStream::ClientTls(tls) => tls.get_ref().1.protocol_version(),
        };
        version.map(|v| match v {
            rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
            rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
            _ => "TLS (unknown version)",
        })
    }

    /// Take the plain stream back for a TLS upgrade.
    /// Fails with `self` when TLS is already active.
    pub fn into_plain(self) -> Result<S, Self> {
        match self {
            NetworkStream::Plain(stream) => Ok(stream),
            other => Err(other),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for NetworkStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for NetworkStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_stream_delegates_io() {
        let (a, b) = duplex(64);
        let mut a = NetworkStream::Plain(a);
        let mut b = NetworkStream::Plain(b);
        assert!(!a.is_encrypted());
        assert!(a.tls_version().is_none());

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_into_plain() {
        let (a, _b) = duplex(8);
        assert!(NetworkStream::Plain(a).into_plain().is_ok());
    }
}
