//! Wire protocol constants for PostgreSQL protocol 3.0
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

// ---------------------------------------------------------------------------
// Startup-phase codes (untyped packets)
// ---------------------------------------------------------------------------

/// Protocol 3.0, encoded as `(major << 16) | minor`
pub const PROTOCOL_VERSION_3_0: u32 = 3 << 16;

/// SSLRequest code (0x04D2162F)
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// CancelRequest code (0x04D2162E)
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// GSSENCRequest code (0x04D21630)
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Total length of a CancelRequest packet, length field included
pub const CANCEL_REQUEST_LEN: u32 = 16;

/// Length of SSLRequest / GSSENCRequest packets
pub const SECURITY_REQUEST_LEN: u32 = 8;

/// Largest message accepted from either peer (100 MiB)
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Largest startup-phase packet accepted from an unauthenticated client
pub const MAX_STARTUP_PACKET_SIZE: u32 = 10_000;

/// Largest PasswordMessage accepted while capturing a client password
pub const MAX_PASSWORD_MESSAGE_SIZE: u32 = 65_535;

/// Single-byte answers to SSLRequest
pub const SSL_ACCEPTED: u8 = b'S';
pub const SSL_REJECTED: u8 = b'N';

// ---------------------------------------------------------------------------
// Frontend message types
// ---------------------------------------------------------------------------

pub const MSG_PASSWORD: u8 = b'p';
pub const MSG_QUERY: u8 = b'Q';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_BIND: u8 = b'B';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_COPY_DATA: u8 = b'd';
pub const MSG_COPY_DONE: u8 = b'c';

// ---------------------------------------------------------------------------
// Backend message types
// ---------------------------------------------------------------------------

pub const MSG_AUTH_REQUEST: u8 = b'R';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';
pub const MSG_DATA_ROW: u8 = b'D';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';
pub const MSG_NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';

// ---------------------------------------------------------------------------
// Authentication request codes (payload of 'R')
// ---------------------------------------------------------------------------

pub const AUTH_OK: u32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;
pub const AUTH_MD5_PASSWORD: u32 = 5;
pub const AUTH_GSS: u32 = 7;
pub const AUTH_SSPI: u32 = 9;
pub const AUTH_SASL: u32 = 10;
pub const AUTH_SASL_CONTINUE: u32 = 11;
pub const AUTH_SASL_FINAL: u32 = 12;

/// SASL mechanism implemented by the client engine
pub const SASL_MECHANISM_SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// ---------------------------------------------------------------------------
// ErrorResponse / NoticeResponse field codes
// ---------------------------------------------------------------------------

/// Localized severity
pub const ERROR_FIELD_SEVERITY: u8 = b'S';
/// Non-localized severity
pub const ERROR_FIELD_SEVERITY_V: u8 = b'V';
pub const ERROR_FIELD_CODE: u8 = b'C';
pub const ERROR_FIELD_MESSAGE: u8 = b'M';
pub const ERROR_FIELD_DETAIL: u8 = b'D';
pub const ERROR_FIELD_HINT: u8 = b'H';

// ---------------------------------------------------------------------------
// SQLSTATE codes used for proxy-generated errors
// ---------------------------------------------------------------------------

pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
pub const SQLSTATE_INVALID_CATALOG_NAME: &str = "3D000";
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

/// Human-readable name for a backend message type, used in logs and
/// `UnexpectedMessage` errors.
pub fn backend_message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_AUTH_REQUEST => "Authentication",
        MSG_BACKEND_KEY_DATA => "BackendKeyData",
        MSG_PARAMETER_STATUS => "ParameterStatus",
        MSG_READY_FOR_QUERY => "ReadyForQuery",
        MSG_ROW_DESCRIPTION => "RowDescription",
        MSG_DATA_ROW => "DataRow",
        MSG_COMMAND_COMPLETE => "CommandComplete",
        MSG_ERROR_RESPONSE => "ErrorResponse",
        MSG_NOTICE_RESPONSE => "NoticeResponse",
        MSG_NEGOTIATE_PROTOCOL_VERSION => "NegotiateProtocolVersion",
        _ => "Unknown",
    }
}

/// Human-readable name for a frontend message type.
pub fn frontend_message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_PASSWORD => "PasswordMessage",
        MSG_QUERY => "Query",
        MSG_TERMINATE => "Terminate",
        MSG_PARSE => "Parse",
        MSG_BIND => "Bind",
        MSG_EXECUTE => "Execute",
        MSG_SYNC => "Sync",
        MSG_COPY_DATA => "CopyData",
        MSG_COPY_DONE => "CopyDone",
        _ => "Unknown",
    }
}

/// Name for an authentication request code, for logs.
pub fn auth_request_name(code: u32) -> &'static str {
    match code {
        AUTH_OK => "AuthenticationOk",
        AUTH_CLEARTEXT_PASSWORD => "AuthenticationCleartextPassword",
        AUTH_MD5_PASSWORD => "AuthenticationMD5Password",
        AUTH_GSS => "AuthenticationGSS",
        AUTH_SSPI => "AuthenticationSSPI",
        AUTH_SASL => "AuthenticationSASL",
        AUTH_SASL_CONTINUE => "AuthenticationSASLContinue",
        AUTH_SASL_FINAL => "AuthenticationSASLFinal",
        _ => "Authentication(unknown)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_codes() {
        assert_eq!(PROTOCOL_VERSION_3_0, 196608);
        assert_eq!(SSL_REQUEST_CODE, 0x04D2_162F);
        assert_eq!(CANCEL_REQUEST_CODE, 0x04D2_162E);
        assert_eq!(GSSENC_REQUEST_CODE, 0x04D2_1630);
    }

    #[test]
    fn test_message_names() {
        assert_eq!(backend_message_name(MSG_READY_FOR_QUERY), "ReadyForQuery");
        assert_eq!(backend_message_name(0xFF), "Unknown");
        assert_eq!(frontend_message_name(MSG_QUERY), "Query");
        assert_eq!(frontend_message_name(MSG_PASSWORD), "PasswordMessage");
        assert_eq!(auth_request_name(AUTH_SASL_FINAL), "AuthenticationSASLFinal");
    }
}
