//! TLS for both legs of the proxy
//!
//! - [`TlsAcceptor`] terminates TLS from clients that sent an SSLRequest
//! - [`TlsConnector`] upgrades the backend connection after the backend
//!   answered `S` to our SSLRequest
//!
//! Both use rustls with the ring provider and work over any
//! `AsyncRead + AsyncWrite` stream, since PostgreSQL negotiates TLS in-band.
//!
//! ```yaml
//! server:
//!   tls:
//!     enabled: true
//!     cert_path: "/etc/pgrelay/server.crt"
//!     key_path: "/etc/pgrelay/server.key"
//! target:
//!   tls:
//!     enabled: true
//!     verify_mode: verify
//!     ca_path: "/etc/pgrelay/db-ca.crt"
//!     server_name: "db.internal"
//! ```

mod acceptor;
mod config;
mod connector;
mod error;

pub use acceptor::TlsAcceptor;
pub use config::{TlsClientConfig, TlsServerConfig, TlsVerifyMode};
pub use connector::TlsConnector;
pub use error::TlsError;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate in a PEM file (a chain is allowed).
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::cert_load(path, "no certificates found in file"));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_certificates_missing_file() {
        let err = load_certificates(Path::new("/nonexistent/pgrelay.crt")).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn test_load_certificates_empty_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem").unwrap();
        let err = load_certificates(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_load_private_key_from_rcgen() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(generated.cert.pem().as_bytes()).unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(generated.key_pair.serialize_pem().as_bytes())
            .unwrap();

        assert_eq!(load_certificates(cert.path()).unwrap().len(), 1);
        assert!(load_private_key(key.path()).is_ok());
        assert!(matches!(
            load_private_key(cert.path()),
            Err(TlsError::PrivateKeyLoad { .. })
        ));
    }
}
