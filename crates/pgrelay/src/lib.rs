//! pgrelay - single-backend intercepting proxy for the PostgreSQL wire protocol
//!
//! This library provides the core functionality for a proxy that:
//! - Terminates client connections, optionally upgrading them to TLS
//! - Authenticates against a backend chosen by a host-supplied [`DialBackend`]
//!   (cleartext, MD5 or SCRAM-SHA-256, optionally over TLS)
//! - Relays protocol messages transparently once both handshakes succeed
//! - Routes out-of-band CancelRequests to the backend that owns the key data

#[macro_use]
mod logging;

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tls;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use protocol::postgres::{BackendKeyData, CancelData, Hello, StartupData};
pub use server::{
    BackendStream, CancelBackend, ConnectionSource, DialBackend, KeyDataRegistry, ListenerStats,
    LogicalConnection, NetworkStream, Proxy, ProxyOptions, TcpDialer,
};
pub use tls::{
    TlsAcceptor, TlsClientConfig, TlsConnector, TlsError, TlsServerConfig, TlsVerifyMode,
};
