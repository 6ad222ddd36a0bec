//! Configuration types

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::server::{DialBackend, ProxyOptions, TcpDialer};
use crate::tls::{TlsAcceptor, TlsClientConfig, TlsConnector, TlsServerConfig};

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// The backend every client is relayed to
    pub target: TargetConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target.host.is_empty() {
            return Err("target.host must not be empty".to_string());
        }
        if self.target.port == 0 {
            return Err("target.port must not be 0".to_string());
        }
        if self.server.connect_timeout_secs == 0 {
            return Err("server.connect_timeout_secs must be greater than 0".to_string());
        }
        if self.server.handshake_timeout_secs == 0 {
            return Err("server.handshake_timeout_secs must be greater than 0".to_string());
        }
        if self.server.idle_timeout_secs == 0 {
            return Err("server.idle_timeout_secs must be greater than 0".to_string());
        }
        if self.target.databases.iter().any(|db| db.is_empty()) {
            return Err("target.databases must not contain empty names".to_string());
        }

        self.server
            .tls
            .validate()
            .map_err(|e| format!("server.tls: {}", e))?;
        self.target
            .tls
            .validate()
            .map_err(|e| format!("target.tls: {}", e))?;
        Ok(())
    }

    /// `address:port` the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_address, self.server.listen_port)
    }

    /// Proxy options, with TLS material loaded from disk.
    pub fn proxy_options(&self) -> Result<ProxyOptions> {
        let client_tls = if self.server.tls.enabled {
            Some(TlsAcceptor::new(&self.server.tls)?)
        } else {
            None
        };

        let backend_tls = if self.target.tls.enabled {
            Some((TlsConnector::new(&self.target.tls)?, self.target.server_name().to_string()))
        } else {
            None
        };

        Ok(ProxyOptions {
            client_tls,
            backend_tls,
            request_password: self.server.request_password,
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            drain_timeout: Duration::from_secs(self.server.drain_timeout_secs),
        })
    }

    /// Dialer for the configured target.
    pub fn dialer(&self) -> Arc<dyn DialBackend> {
        Arc::new(
            TcpDialer::new(&self.target.host, self.target.port)
                .with_databases(self.target.databases.clone())
                .with_connect_timeout(Duration::from_secs(self.server.connect_timeout_secs)),
        )
    }
}

/// Server listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port to listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Backend connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-phase handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Close the listener when no client connects within this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds the backend may keep sending after the client terminated
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Ask clients for a cleartext password to relay to the backend
    #[serde(default)]
    pub request_password: bool,
    /// TLS configuration for accepting client connections
    #[serde(default)]
    pub tls: TlsServerConfig,
}

/// Backend database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Backend host
    pub host: String,
    /// Backend port
    #[serde(default = "default_target_port")]
    pub port: u16,
    /// Databases served; empty serves any
    #[serde(default)]
    pub databases: Vec<String>,
    /// TLS configuration for connecting to the backend
    #[serde(default)]
    pub tls: TlsClientConfig,
}

impl TargetConfig {
    /// Name the backend certificate is verified against
    pub fn server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6432
}

fn default_target_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
