//! Configuration loader

use super::Config;
use crate::error::{ProxyError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// Also applies PGRELAY_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Also applies PGRELAY_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(ProxyError::Config)?;
    Ok(config)
}

/// Apply PGRELAY_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `PGRELAY_LISTEN_ADDRESS` - Override listen address
/// - `PGRELAY_LISTEN_PORT` - Override listen port
/// - `PGRELAY_TARGET_HOST` - Override target host
/// - `PGRELAY_TARGET_PORT` - Override target port
/// - `PGRELAY_LOG_LEVEL` - Override log level
/// - `PGRELAY_CONNECT_TIMEOUT_SECS` - Override backend connect timeout
/// - `PGRELAY_IDLE_TIMEOUT_SECS` - Override listener idle timeout
/// - `PGRELAY_REQUEST_PASSWORD` - Override password capture (`true`/`false`)
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("PGRELAY_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from PGRELAY_LISTEN_ADDRESS");
        config.server.listen_address = val;
    }
    if let Ok(val) = std::env::var("PGRELAY_LISTEN_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding listen_port from PGRELAY_LISTEN_PORT");
            config.server.listen_port = port;
        }
    }
    if let Ok(val) = std::env::var("PGRELAY_TARGET_HOST") {
        debug!("Overriding target host from PGRELAY_TARGET_HOST");
        config.target.host = val;
    }
    if let Ok(val) = std::env::var("PGRELAY_TARGET_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding target port from PGRELAY_TARGET_PORT");
            config.target.port = port;
        }
    }
    if let Ok(val) = std::env::var("PGRELAY_LOG_LEVEL") {
        debug!("Overriding log level from PGRELAY_LOG_LEVEL");
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("PGRELAY_CONNECT_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding connect_timeout from PGRELAY_CONNECT_TIMEOUT_SECS");
            config.server.connect_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("PGRELAY_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding idle_timeout from PGRELAY_IDLE_TIMEOUT_SECS");
            config.server.idle_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("PGRELAY_REQUEST_PASSWORD") {
        if let Ok(flag) = val.parse::<bool>() {
            debug!("Overriding request_password from PGRELAY_REQUEST_PASSWORD");
            config.server.request_password = flag;
        }
    }
}

/// Resolve environment variables in a string value
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - curly brace syntax
/// - `$VAR_NAME` - simple syntax (whole value must be the reference)
///
/// If the environment variable is not set, the original value is preserved.
fn resolve_env_var(value: &str) -> String {
    let var_name = if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        name
    } else if let Some(name) = value.strip_prefix('$') {
        if name.is_empty() || name.contains(' ') {
            return value.to_string();
        }
        name
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

/// Resolve environment variables in all config fields that support it
fn resolve_config_env_vars(config: &mut Config) {
    config.target.host = resolve_env_var(&config.target.host);
    for db in config.target.databases.iter_mut() {
        *db = resolve_env_var(db);
    }
    if let Some(ref name) = config.target.tls.server_name {
        config.target.tls.server_name = Some(resolve_env_var(name));
    }
}
