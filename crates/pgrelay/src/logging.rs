//! Logging macros that set target to "pgrelay" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "pgrelay::server::handshake::client"), which makes filter
//! directives and embedding hosts' logger names needlessly verbose.
//! These macros ensure all logs from this crate use a single "pgrelay" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "pgrelay", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "pgrelay", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "pgrelay", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "pgrelay", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "pgrelay", $($arg)*) };
}
