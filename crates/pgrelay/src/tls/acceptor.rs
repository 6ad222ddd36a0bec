//! Client-facing TLS

use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use super::{crypto_provider, load_certificates, load_private_key, TlsError, TlsServerConfig};

/// Completes the server side of a TLS handshake on an accepted stream.
///
/// # Example
///
/// ```ignore
/// let config = TlsServerConfig {
///     enabled: true,
///     cert_path: Some("/etc/pgrelay/server.crt".into()),
///     key_path: Some("/etc/pgrelay/server.key".into()),
/// };
///
/// let acceptor = TlsAcceptor::new(&config)?;
/// let tls_stream = acceptor.accept(tcp_stream).await?;
/// ```
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build from PEM certificate and key files named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `cert_path` or `key_path` is missing
    /// - The certificate chain cannot be read or contains no certificates
    /// - The private key cannot be read or parsed
    /// - rustls rejects the certificate/key pair
    pub fn new(config: &TlsServerConfig) -> Result<Self, TlsError> {
        config.validate().map_err(TlsError::config)?;

        let cert_path = config
            .cert_path
            .as_ref()
            .ok_or_else(|| TlsError::config("cert_path is required"))?;
        let key_path = config
            .key_path
            .as_ref()
            .ok_or_else(|| TlsError::config("key_path is required"))?;

        let certs = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the handshake over `stream`, after `S` was sent in clear.
    pub async fn accept<S>(&self, stream: S) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_acceptor_missing_key_path() {
        let config = TlsServerConfig {
            enabled: true,
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: None,
        };
        let err = TlsAcceptor::new(&config).err().unwrap();
        assert!(err.to_string().contains("key_path"));
    }

    #[test]
    fn test_acceptor_nonexistent_cert_file() {
        let config = TlsServerConfig {
            enabled: true,
            cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_path: Some(PathBuf::from("/nonexistent/key.pem")),
        };
        assert!(matches!(
            TlsAcceptor::new(&config),
            Err(TlsError::CertificateLoad { .. })
        ));
    }
}
