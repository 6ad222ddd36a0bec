//! Client-facing startup negotiation

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};
use crate::protocol::postgres::codec::{
    build_auth_cleartext_password, expect_message_with_limit, parse_password_message,
    read_startup_packet, write_message,
};
use crate::protocol::postgres::constants::*;
use crate::protocol::postgres::{Hello, StartupData, StartupPacket};
use crate::server::stream::NetworkStream;
use crate::tls::TlsAcceptor;

/// Outcome of the client handshake.
pub struct ClientHandshake<S> {
    /// Client stream, TLS-wrapped if the client asked for it and we accepted
    pub stream: NetworkStream<S>,
    pub hello: Hello,
}

/// Drives the client side of startup until the client has said what it wants.
#[derive(Clone)]
pub struct ClientNegotiator {
    tls: Option<TlsAcceptor>,
    request_password: bool,
}

impl ClientNegotiator {
    pub fn new(tls: Option<TlsAcceptor>, request_password: bool) -> Self {
        Self {
            tls,
            request_password,
        }
    }

    /// Run the negotiation.
    ///
    /// SSLRequests are answered `N` when no acceptor is configured and the
    /// client may carry on in clear. Once TLS is active a second SSLRequest
    /// is an error.
    pub async fn negotiate<S>(&self, stream: S) -> Result<ClientHandshake<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = NetworkStream::Plain(stream);

        loop {
            match read_startup_packet(&mut stream).await? {
                StartupPacket::SslRequest => {
                    if stream.is_encrypted() {
                        return Err(ProxyError::DuplicateTlsRequest);
                    }
                    stream = self.answer_ssl_request(stream).await?;
                }
                StartupPacket::GssEncRequest => {
                    debug!("Client requested GSSAPI encryption");
                    return Err(ProxyError::UnsupportedGssapi);
                }
                StartupPacket::Cancel(cancel) => {
                    debug!("Client sent CancelRequest for pid {}", cancel.process_id);
                    return Ok(ClientHandshake {
                        stream,
                        hello: Hello::Cancel(cancel),
                    });
                }
                StartupPacket::Startup(parameters) => {
                    let mut startup = StartupData::from_parameters(parameters)?;
                    debug!(
                        "Client startup as '{}' to database '{}'",
                        startup.username, startup.database
                    );

                    if self.request_password {
                        startup = startup.with_password(request_password(&mut stream).await?);
                    }

                    return Ok(ClientHandshake {
                        stream,
                        hello: Hello::Startup(startup),
                    });
                }
            }
        }
    }

    async fn answer_ssl_request<S>(&self, mut stream: NetworkStream<S>) -> Result<NetworkStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(acceptor) = &self.tls else {
            stream.write_all(&[SSL_REJECTED]).await?;
            stream.flush().await?;
            debug!("Rejected SSL request (TLS not configured)");
            return Ok(stream);
        };

        stream.write_all(&[SSL_ACCEPTED]).await?;
        stream.flush().await?;

        let plain = stream
            .into_plain()
            .map_err(|_| ProxyError::DuplicateTlsRequest)?;
        let tls = acceptor.accept(plain).await.map_err(|e| {
            error!("Client TLS handshake failed: {}", e);
            ProxyError::from(e)
        })?;

        let stream = NetworkStream::ServerTls(Box::new(tls));
        if let Some(version) = stream.tls_version() {
            debug!("Client TLS handshake complete: {}", version);
        }
        Ok(stream)
    }
}

/// Ask for a cleartext password and read the PasswordMessage reply.
async fn request_password<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, MSG_AUTH_REQUEST, &build_auth_cleartext_password()).await?;
    let payload = expect_message_with_limit(
        stream,
        MSG_PASSWORD,
        frontend_message_name,
        MAX_PASSWORD_MESSAGE_SIZE,
    )
    .await?;
    parse_password_message(&payload)
}
