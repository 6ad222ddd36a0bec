//! PostgreSQL protocol 3.0
//!
//! - Protocol constants and message type names
//! - Message structures
//! - Codec (read/write/parse/build)
//! - Backend authentication (MD5 and SCRAM-SHA-256)
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

pub mod auth;
pub mod codec;
pub mod constants;
pub mod messages;

pub use auth::{compute_md5_password, ScramClient};
pub use codec::StartupPacket;
pub use messages::*;
