//! Startup negotiation on both legs of a proxied connection
//!
//! 1. [`ClientNegotiator`] answers SSLRequests from the client, classifies
//!    the first real packet as a session or a cancel request, and optionally
//!    asks the client for a cleartext password.
//! 2. [`ServerNegotiator`] opens the session on the backend: optional TLS,
//!    StartupMessage, authentication, then forwards everything up to the
//!    first ReadyForQuery to the client.

mod client;
mod server;

pub use client::{ClientHandshake, ClientNegotiator};
pub use server::{ServerHandshake, ServerNegotiator};
