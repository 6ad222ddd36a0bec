//! Backend-facing startup negotiation
//!
//! Opens the session on the backend on behalf of the client:
//! 1. Optional SSLRequest and TLS upgrade
//! 2. StartupMessage built from the client's parameters
//! 3. Authentication (cleartext, MD5 or SCRAM-SHA-256) with the password
//!    captured from the client
//! 4. AuthenticationOk, ParameterStatus, BackendKeyData... forwarded to the
//!    client up to and including the first ReadyForQuery

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{ProxyError, Result};
use crate::protocol::postgres::auth::{compute_md5_password, ScramClient};
use crate::protocol::postgres::codec::{
    build_auth_ok, build_password_message, build_sasl_initial_response, build_sasl_response,
    parse_authentication, parse_backend_key_data, parse_error_notice, parse_parameter_status,
    parse_ready_for_query, read_message, write_error_response, write_message, write_ssl_request,
    write_startup_message, MIN_MESSAGE_LENGTH,
};
use crate::protocol::postgres::constants::*;
use crate::protocol::postgres::{AuthenticationMessage, BackendKeyData, StartupData};
use crate::server::stream::NetworkStream;
use crate::tls::TlsConnector;

/// Outcome of the backend handshake.
pub struct ServerHandshake<B> {
    /// Authenticated backend stream, ready for the relay
    pub stream: NetworkStream<B>,
    /// Key data the backend issued, if it sent any
    pub key_data: Option<BackendKeyData>,
}

/// Drives the backend side of startup.
#[derive(Clone, Default)]
pub struct ServerNegotiator {
    tls: Option<(TlsConnector, String)>,
}

impl ServerNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request TLS from the backend, verifying it as `server_name`.
    pub fn with_tls(mut self, connector: TlsConnector, server_name: impl Into<String>) -> Self {
        self.tls = Some((connector, server_name.into()));
        self
    }

    /// Open the session on `backend` and forward its greeting to `client`.
    ///
    /// If the backend refuses the session before accepting it, the client
    /// is sent a FATAL ErrorResponse carrying the backend's code and message
    /// (or the proxy's own error) before the error is returned. Once
    /// AuthenticationOk has been forwarded the client sees backend messages
    /// verbatim, ErrorResponse included.
    pub async fn negotiate<B, C>(
        &self,
        backend: B,
        startup: &StartupData,
        client: &mut C,
    ) -> Result<ServerHandshake<B>>
    where
        B: AsyncRead + AsyncWrite + Unpin,
        C: AsyncWrite + Unpin,
    {
        let stream = match self.authenticate(backend, startup).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(write_err) = write_error_response(client, &e).await {
                    debug!("Failed to report backend error to client: {}", write_err);
                }
                return Err(e);
            }
        };

        forward_greeting(stream, client).await
    }

    /// Steps 1-3: TLS, StartupMessage and authentication.
    pub async fn authenticate<B>(
        &self,
        backend: B,
        startup: &StartupData,
    ) -> Result<NetworkStream<B>>
    where
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = match &self.tls {
            Some((connector, server_name)) => {
                request_tls(backend, connector, server_name).await?
            }
            None => NetworkStream::Plain(backend),
        };

        write_startup_message(&mut stream, &startup.backend_parameters()).await?;
        debug!(
            "Sent StartupMessage to backend as '{}' for database '{}'",
            startup.username, startup.database
        );

        loop {
            match read_auth_request(&mut stream).await? {
                AuthenticationMessage::Ok => {
                    debug!("Backend authentication successful");
                    return Ok(stream);
                }
                AuthenticationMessage::CleartextPassword => {
                    debug!("Backend requested cleartext password");
                    let password = require_password(startup)?;
                    write_message(&mut stream, MSG_PASSWORD, &build_password_message(password))
                        .await?;
                }
                AuthenticationMessage::Md5Password { salt } => {
                    debug!("Backend requested MD5 password");
                    let password = require_password(startup)?;
                    let hashed = compute_md5_password(&startup.username, password, &salt);
                    write_message(&mut stream, MSG_PASSWORD, &build_password_message(&hashed))
                        .await?;
                }
                AuthenticationMessage::Sasl { mechanisms } => {
                    debug!("Backend requested SASL authentication: {:?}", mechanisms);
                    let password = require_password(startup)?;
                    authenticate_scram(&mut stream, &mechanisms, password).await?;
                }
                other @ (AuthenticationMessage::SaslContinue { .. }
                | AuthenticationMessage::SaslFinal { .. }) => {
                    return Err(ProxyError::UnexpectedBackendMessage(format!(
                        "{:?} outside of a SASL exchange",
                        other
                    )));
                }
                AuthenticationMessage::Unsupported(code) => {
                    warn!("Unsupported authentication request: {}", auth_request_name(code));
                    return Err(ProxyError::UnexpectedBackendMessage(format!(
                        "{} ({})",
                        auth_request_name(code),
                        code
                    )));
                }
            }
        }
    }
}

fn require_password(startup: &StartupData) -> Result<&str> {
    startup.password().ok_or(ProxyError::MissingPassword)
}

/// SSLRequest → `S` upgrades, `N` stays in clear, `E` is the server's error.
async fn request_tls<B>(
    mut backend: B,
    connector: &TlsConnector,
    server_name: &str,
) -> Result<NetworkStream<B>>
where
    B: AsyncRead + AsyncWrite + Unpin,
{
    write_ssl_request(&mut backend).await?;

    let mut response = [0u8; 1];
    backend.read_exact(&mut response).await?;

    match response[0] {
        SSL_ACCEPTED => {
            let tls = connector.connect(backend, server_name).await.map_err(|e| {
                error!("TLS handshake with backend failed: {}", e);
                ProxyError::from(e)
            })?;
            let stream = NetworkStream::ClientTls(Box::new(tls));
            if let Some(version) = stream.tls_version() {
                debug!("Backend TLS handshake complete: {}", version);
            }
            Ok(stream)
        }
        SSL_REJECTED => {
            warn!("Backend rejected SSL request, continuing without TLS");
            Ok(NetworkStream::Plain(backend))
        }
        MSG_ERROR_RESPONSE => {
            // The type byte is already consumed; the rest is a normal message
            let mut length = [0u8; 4];
            backend.read_exact(&mut length).await?;
            let length = u32::from_be_bytes(length);
            if !(MIN_MESSAGE_LENGTH..=MAX_MESSAGE_SIZE).contains(&length) {
                return Err(ProxyError::Framing(format!(
                    "invalid message length {}",
                    length
                )));
            }
            let mut payload = vec![0u8; (length - 4) as usize];
            backend.read_exact(&mut payload).await?;
            Err(parse_error_notice(&payload)?.into_error())
        }
        other => Err(ProxyError::UnexpectedTlsResponse(other)),
    }
}

/// Read an Authentication request. ErrorResponse becomes the server's error.
async fn read_auth_request<S>(stream: &mut S) -> Result<AuthenticationMessage>
where
    S: AsyncRead + Unpin,
{
    let (msg_type, payload) = read_message(stream).await?;
    match msg_type {
        MSG_AUTH_REQUEST => parse_authentication(&payload),
        MSG_ERROR_RESPONSE => {
            let err = parse_error_notice(&payload)?.into_error();
            error!("Backend authentication failed: {}", err);
            Err(err)
        }
        other => Err(ProxyError::UnexpectedBackendMessage(format!(
            "{} ('{}') during authentication",
            backend_message_name(other),
            other as char
        ))),
    }
}

async fn authenticate_scram<S>(stream: &mut S, mechanisms: &[String], password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scram = ScramClient::new(mechanisms, password)?;

    let client_first = scram.client_first_message()?;
    write_message(
        stream,
        MSG_PASSWORD,
        &build_sasl_initial_response(scram.mechanism(), &client_first),
    )
    .await?;

    let server_first = match read_auth_request(stream).await? {
        AuthenticationMessage::SaslContinue { data } => data,
        other => return Err(unexpected_sasl_step("SASLContinue", &other)),
    };
    let client_final = scram.process_server_first(&server_first)?;
    write_message(stream, MSG_PASSWORD, &build_sasl_response(&client_final)).await?;

    let server_final = match read_auth_request(stream).await? {
        AuthenticationMessage::SaslFinal { data } => data,
        other => return Err(unexpected_sasl_step("SASLFinal", &other)),
    };
    scram.verify_server_final(&server_final)?;

    debug!("SCRAM-SHA-256 exchange complete");
    Ok(())
}

fn unexpected_sasl_step(expected: &str, actual: &AuthenticationMessage) -> ProxyError {
    ProxyError::UnexpectedBackendMessage(format!("expected {}, got {:?}", expected, actual))
}

/// Step 4: send AuthenticationOk, then relay backend messages until
/// ReadyForQuery. BackendKeyData is remembered for cancel routing.
async fn forward_greeting<B, C>(
    mut stream: NetworkStream<B>,
    client: &mut C,
) -> Result<ServerHandshake<B>>
where
    B: AsyncRead + AsyncWrite + Unpin,
    C: AsyncWrite + Unpin,
{
    write_message(client, MSG_AUTH_REQUEST, &build_auth_ok()).await?;

    let mut key_data = None;
    loop {
        let (msg_type, payload) = read_message(&mut stream).await?;
        write_message(client, msg_type, &payload).await?;

        match msg_type {
            MSG_BACKEND_KEY_DATA => {
                let key = parse_backend_key_data(&payload)?;
                trace!("BackendKeyData: pid {}", key.process_id);
                key_data = Some(key);
            }
            MSG_PARAMETER_STATUS => {
                let param = parse_parameter_status(&payload)?;
                trace!("ParameterStatus: {} = {}", param.name, param.value);
            }
            MSG_READY_FOR_QUERY => {
                let status = parse_ready_for_query(&payload)?;
                debug!("Backend ready for query ({:?})", status);
                return Ok(ServerHandshake { stream, key_data });
            }
            MSG_ERROR_RESPONSE => {
                return Err(parse_error_notice(&payload)?.into_error());
            }
            _ => {}
        }
    }
}
