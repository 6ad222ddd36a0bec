//! Error types for pgrelay

use thiserror::Error;

use crate::protocol::postgres::constants::{
    SQLSTATE_CONNECTION_FAILURE, SQLSTATE_INTERNAL_ERROR, SQLSTATE_INVALID_AUTHORIZATION,
    SQLSTATE_INVALID_CATALOG_NAME, SQLSTATE_INVALID_PASSWORD, SQLSTATE_PROTOCOL_VIOLATION,
};
use crate::tls::TlsError;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Truncated or malformed wire message
    #[error("Framing error: {0}")]
    Framing(String),

    /// A specific message type was required but another one arrived
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Name of the message that was required
        expected: &'static str,
        /// Name of the message that was received
        actual: String,
    },

    /// Client sent a second SSLRequest after TLS was already negotiated
    #[error("Duplicate SSLRequest: TLS is already active")]
    DuplicateTlsRequest,

    /// Client requested GSSAPI transport encryption
    #[error("GSSAPI encryption is not supported")]
    UnsupportedGssapi,

    /// Backend answered SSLRequest with something other than S, N or E
    #[error("Unexpected response to SSLRequest: 0x{0:02X}")]
    UnexpectedTlsResponse(u8),

    /// None of the offered SASL mechanisms is supported
    #[error("Unsupported SASL mechanisms: {0:?}")]
    UnsupportedMechanism(Vec<String>),

    /// SCRAM server message is missing fields or has them out of order
    #[error("Malformed SCRAM server message: {0}")]
    MalformedServerMessage(String),

    /// SCRAM combined nonce does not extend the client nonce
    #[error("SCRAM: server nonce does not extend client nonce")]
    InvalidNonce,

    /// SCRAM iteration count is not a positive integer
    #[error("SCRAM: invalid iteration count: {0}")]
    InvalidIterationCount(String),

    /// SCRAM server signature verification failed
    #[error("SCRAM: server signature mismatch")]
    ServerSignatureMismatch,

    /// SCRAM server reported an error (e=...)
    #[error("SCRAM: server error: {0}")]
    ScramServerError(String),

    /// Backend asked for a password but none was captured from the client
    #[error("Backend requested a password but none was captured from the client")]
    MissingPassword,

    /// Backend sent an ErrorResponse
    #[error("Server error {code}: {message}")]
    ServerError {
        /// SQLSTATE code reported by the backend
        code: String,
        /// Primary message reported by the backend
        message: String,
    },

    /// Backend sent a message that is not valid in the current phase
    #[error("Unexpected backend message: {0}")]
    UnexpectedBackendMessage(String),

    /// The host has no backend for the requested database
    #[error("Database \"{0}\" does not exist")]
    DatabaseNotFound(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The listener was closed and no longer accepts connections
    #[error("Listener closed: {0}")]
    ListenerClosed(String),

    /// Generic protocol state error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

impl ProxyError {
    /// SQLSTATE code used when this error is reported to a client
    /// in a FATAL ErrorResponse.
    pub fn sqlstate(&self) -> &str {
        match self {
            ProxyError::ServerError { code, .. } => code,
            ProxyError::DatabaseNotFound(_) => SQLSTATE_INVALID_CATALOG_NAME,
            ProxyError::MissingPassword => SQLSTATE_INVALID_PASSWORD,
            ProxyError::UnsupportedMechanism(_)
            | ProxyError::MalformedServerMessage(_)
            | ProxyError::InvalidNonce
            | ProxyError::InvalidIterationCount(_)
            | ProxyError::ServerSignatureMismatch
            | ProxyError::ScramServerError(_) => SQLSTATE_INVALID_AUTHORIZATION,
            ProxyError::Framing(_)
            | ProxyError::UnexpectedMessage { .. }
            | ProxyError::DuplicateTlsRequest
            | ProxyError::UnsupportedGssapi
            | ProxyError::UnexpectedTlsResponse(_)
            | ProxyError::UnexpectedBackendMessage(_)
            | ProxyError::Protocol(_) => SQLSTATE_PROTOCOL_VIOLATION,
            ProxyError::Io(_)
            | ProxyError::Connection(_)
            | ProxyError::Timeout(_)
            | ProxyError::Tls(_) => SQLSTATE_CONNECTION_FAILURE,
            ProxyError::Config(_) | ProxyError::ListenerClosed(_) => SQLSTATE_INTERNAL_ERROR,
        }
    }

    /// Message used when this error is reported to a client.
    ///
    /// Backend errors are passed through verbatim; everything else uses the
    /// error's display form.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::ServerError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_passes_code_through() {
        let err = ProxyError::ServerError {
            code: "28P01".into(),
            message: "password authentication failed for user \"alice\"".into(),
        };
        assert_eq!(err.sqlstate(), "28P01");
        assert_eq!(
            err.client_message(),
            "password authentication failed for user \"alice\""
        );
    }

    #[test]
    fn test_database_not_found_sqlstate() {
        let err = ProxyError::DatabaseNotFound("appdb".into());
        assert_eq!(err.sqlstate(), "3D000");
        assert!(err.client_message().contains("appdb"));
    }

    #[test]
    fn test_unexpected_message_display() {
        let err = ProxyError::UnexpectedMessage {
            expected: "PasswordMessage",
            actual: "Query".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unexpected message: expected PasswordMessage, got Query"
        );
        assert_eq!(err.sqlstate(), "08P01");
    }

    #[test]
    fn test_auth_errors_map_to_authorization_sqlstate() {
        assert_eq!(ProxyError::InvalidNonce.sqlstate(), "28000");
        assert_eq!(ProxyError::ServerSignatureMismatch.sqlstate(), "28000");
        assert_eq!(ProxyError::MissingPassword.sqlstate(), "28P01");
    }
}
