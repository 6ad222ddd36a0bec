//! TLS configuration for the client-facing and backend legs

use serde::Deserialize;
use std::path::PathBuf;

/// Client-facing TLS (the proxy answers `S` to SSLRequest when enabled).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsServerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Certificate chain presented to clients, PEM
    pub cert_path: Option<PathBuf>,

    /// Private key for `cert_path`, PEM
    pub key_path: Option<PathBuf>,
}

/// Backend TLS (the proxy sends SSLRequest to the backend when enabled).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsClientConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub verify_mode: TlsVerifyMode,

    /// CA bundle used to verify the backend; webpki roots when absent
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,

    /// Key for `client_cert_path`
    pub client_key_path: Option<PathBuf>,

    /// SNI / verification name; defaults to the target host
    pub server_name: Option<String>,
}

/// How the backend certificate is checked.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerifyMode {
    /// CA chain and host name
    #[default]
    Verify,

    /// Accept any certificate. Development only.
    None,
}

impl TlsServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if self.cert_path.is_none() {
                return Err("TLS enabled but cert_path not specified".to_string());
            }
            if self.key_path.is_none() {
                return Err("TLS enabled but key_path not specified".to_string());
            }
        }
        Ok(())
    }
}

impl TlsClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(
                "client_cert_path and client_key_path must both be specified or both omitted"
                    .to_string(),
            );
        }
        if matches!(&self.server_name, Some(name) if name.is_empty()) {
            return Err("server_name must not be empty".to_string());
        }
        Ok(())
    }
}
