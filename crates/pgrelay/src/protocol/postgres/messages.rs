//! PostgreSQL protocol message structures
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::collections::HashMap;
use std::fmt;

use zeroize::Zeroizing;

use super::constants::{
    CANCEL_REQUEST_CODE, CANCEL_REQUEST_LEN, ERROR_FIELD_CODE, ERROR_FIELD_DETAIL,
    ERROR_FIELD_HINT, ERROR_FIELD_MESSAGE, ERROR_FIELD_SEVERITY, ERROR_FIELD_SEVERITY_V,
    SQLSTATE_PROTOCOL_VIOLATION,
};
use crate::error::{ProxyError, Result};

// ============================================================================
// Client hello
// ============================================================================

/// Parameters announced by a client in its StartupMessage.
///
/// Built once per client handshake. The password, when the proxy was asked to
/// capture one, is kept only so it can be relayed to the backend.
#[derive(Clone)]
pub struct StartupData {
    /// Every key/value pair from the StartupMessage, `user` and `database`
    /// included
    pub parameters: HashMap<String, String>,
    /// Target database; defaults to the user name like the server does
    pub database: String,
    /// Login role
    pub username: String,
    /// Password captured from the client, if any
    pub password: Option<Zeroizing<String>>,
}

impl StartupData {
    /// Build from the raw startup parameters.
    ///
    /// Fails when `user` is absent, matching the backend's own check.
    pub fn from_parameters(parameters: HashMap<String, String>) -> Result<Self> {
        let username = match parameters.get("user") {
            Some(user) if !user.is_empty() => user.clone(),
            _ => {
                return Err(ProxyError::Protocol(
                    "no PostgreSQL user name specified in startup packet".into(),
                ))
            }
        };
        let database = parameters
            .get("database")
            .filter(|db| !db.is_empty())
            .cloned()
            .unwrap_or_else(|| username.clone());

        Ok(Self {
            parameters,
            database,
            username,
            password: None,
        })
    }

    /// Shorthand used by dialers and tests.
    pub fn new(username: &str, database: &str) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("user".to_string(), username.to_string());
        parameters.insert("database".to_string(), database.to_string());
        Self {
            parameters,
            database: database.to_string(),
            username: username.to_string(),
            password: None,
        }
    }

    /// Attach a captured password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// The captured password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// `application_name`, when the client set one.
    pub fn application_name(&self) -> Option<&str> {
        self.parameters.get("application_name").map(|s| s.as_str())
    }

    /// Parameters to forward to the backend in our own StartupMessage.
    ///
    /// `user` and `database` always come from the resolved fields; the rest
    /// are passed through in a stable order.
    pub fn backend_parameters(&self) -> Vec<(&str, &str)> {
        let mut extra: Vec<(&str, &str)> = self
            .parameters
            .iter()
            .filter(|(k, _)| k.as_str() != "user" && k.as_str() != "database")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        extra.sort_unstable();

        let mut params = vec![
            ("user", self.username.as_str()),
            ("database", self.database.as_str()),
        ];
        params.extend(extra);
        params
    }
}

impl fmt::Debug for StartupData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupData")
            .field("username", &self.username)
            .field("database", &self.database)
            .field("parameters", &self.parameters.len())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Out-of-band cancellation request from a client.
///
/// Wire format (16 bytes, all big-endian u32): length 16, code 80877102,
/// process id, secret key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelData {
    pub process_id: u32,
    pub secret_key: u32,
}

impl CancelData {
    pub fn new(process_id: u32, secret_key: u32) -> Self {
        Self {
            process_id,
            secret_key,
        }
    }

    /// Encode as a complete CancelRequest packet.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&CANCEL_REQUEST_LEN.to_be_bytes());
        buf[4..8].copy_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        buf[8..12].copy_from_slice(&self.process_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.secret_key.to_be_bytes());
        buf
    }

    /// Decode a complete CancelRequest packet.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CANCEL_REQUEST_LEN as usize {
            return Err(ProxyError::Framing(format!(
                "CancelRequest must be {} bytes, got {}",
                CANCEL_REQUEST_LEN,
                buf.len()
            )));
        }
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        if word(0) != CANCEL_REQUEST_LEN {
            return Err(ProxyError::Framing(format!(
                "CancelRequest length field is {}, expected {}",
                word(0),
                CANCEL_REQUEST_LEN
            )));
        }
        if word(4) != CANCEL_REQUEST_CODE {
            return Err(ProxyError::Framing(format!(
                "not a CancelRequest (code {})",
                word(4)
            )));
        }
        Ok(Self::new(word(8), word(12)))
    }
}

/// What a client asked for once startup negotiation is over.
#[derive(Debug, Clone)]
pub enum Hello {
    /// Regular session
    Startup(StartupData),
    /// Side connection carrying a cancellation request
    Cancel(CancelData),
}

// ============================================================================
// Authentication
// ============================================================================

/// Authentication request from the backend (type 'R').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    Ok,
    CleartextPassword,
    Md5Password {
        salt: [u8; 4],
    },
    Sasl {
        mechanisms: Vec<String>,
    },
    SaslContinue {
        data: Vec<u8>,
    },
    SaslFinal {
        data: Vec<u8>,
    },
    /// Any other code (GSS, SSPI, Kerberos...), which the proxy cannot answer
    Unsupported(u32),
}

// ============================================================================
// Server information
// ============================================================================

/// Backend key data (type 'K').
///
/// Copied out of the receive buffer; the registry keys on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

impl BackendKeyData {
    pub fn new(process_id: u32, secret_key: u32) -> Self {
        Self {
            process_id,
            secret_key,
        }
    }
}

impl From<CancelData> for BackendKeyData {
    fn from(cancel: CancelData) -> Self {
        Self::new(cancel.process_id, cancel.secret_key)
    }
}

impl From<BackendKeyData> for CancelData {
    fn from(key: BackendKeyData) -> Self {
        Self::new(key.process_id, key.secret_key)
    }
}

/// Parameter status (type 'S').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Errors and notices
// ============================================================================

/// Error or notice response (types 'E' and 'N').
#[derive(Debug, Clone, Default)]
pub struct ErrorNoticeResponse {
    /// Fields keyed by field type byte
    pub fields: HashMap<u8, String>,
}

impl ErrorNoticeResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// FATAL response with both severity fields, SQLSTATE and message.
    pub fn fatal(code: &str, message: &str) -> Self {
        let mut resp = Self::new();
        resp.set_field(ERROR_FIELD_SEVERITY, "FATAL");
        resp.set_field(ERROR_FIELD_SEVERITY_V, "FATAL");
        resp.set_field(ERROR_FIELD_CODE, code);
        resp.set_field(ERROR_FIELD_MESSAGE, message);
        resp
    }

    /// FATAL response describing a proxy error.
    pub fn from_error(err: &ProxyError) -> Self {
        Self::fatal(err.sqlstate(), &err.client_message())
    }

    pub fn set_field(&mut self, field_type: u8, value: &str) {
        self.fields.insert(field_type, value.to_string());
    }

    pub fn get_field(&self, field_type: u8) -> Option<&str> {
        self.fields.get(&field_type).map(|s| s.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_SEVERITY)
    }

    pub fn code(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_MESSAGE)
    }

    pub fn detail(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_DETAIL)
    }

    pub fn hint(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_HINT)
    }

    /// Convert a backend-reported error into `ProxyError::ServerError`.
    pub fn into_error(self) -> ProxyError {
        ProxyError::ServerError {
            code: self
                .code()
                .unwrap_or(SQLSTATE_PROTOCOL_VIOLATION)
                .to_string(),
            message: self.message().unwrap_or("unknown server error").to_string(),
        }
    }
}
