//! Server module for pgrelay
//!
//! This module contains:
//! - Accept loop and per-connection dispatch ([`Proxy`])
//! - Client- and backend-facing startup negotiation
//! - Steady-state relay
//! - Backend dialing and the cancel-routing registry
//! - Network stream abstraction (plain/TLS)

pub mod backend;
pub mod handshake;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod stream;

pub use backend::{BackendStream, CancelBackend, DialBackend, LogicalConnection, TcpDialer};
pub use handshake::{ClientHandshake, ClientNegotiator, ServerHandshake, ServerNegotiator};
pub use proxy::{ConnectionSource, ListenerStats, Proxy, ProxyOptions};
pub use registry::KeyDataRegistry;
pub use relay::Session;
pub use stream::NetworkStream;
