//! Configuration module for pgrelay
//!
//! ```yaml
//! server:
//!   listen_address: "0.0.0.0"
//!   listen_port: 6432
//!   request_password: true
//! target:
//!   host: "postgres.internal"
//!   port: 5432
//!   databases: ["app", "reporting"]
//! logging:
//!   level: info
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use types::*;
