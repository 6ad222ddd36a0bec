//! PostgreSQL message codec (read/write)
//!
//! Startup-phase packets have no type byte: `length (4) + code (4) + data`.
//! Every later message is `type (1) + length (4, includes itself) + payload`.

use std::collections::HashMap;
use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::constants::*;
use super::messages::*;

/// Minimum typed message length (just the length field)
pub const MIN_MESSAGE_LENGTH: u32 = 4;

// ============================================================================
// Low-level helpers
// ============================================================================

async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// `read_exact` that reports a short read as a framing error rather than a
/// closed connection. Used once the first byte of a message has arrived.
async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProxyError::Framing(format!(
            "truncated message: expected {} more bytes",
            buf.len()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Read a NUL-terminated string starting at `offset`.
/// Returns the string and the bytes consumed, terminator included.
fn read_cstring_from_buf(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let rest = buf
        .get(offset..)
        .ok_or_else(|| ProxyError::Framing("string offset past end of message".into()))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Framing("missing NUL terminator in string".into()))?;
    let s = std::str::from_utf8(&rest[..end])
        .map_err(|_| ProxyError::Framing("invalid UTF-8 in string".into()))?;
    Ok((s.to_string(), end + 1))
}

fn be_u32_at(payload: &[u8], offset: usize) -> Option<u32> {
    payload
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

// ============================================================================
// Startup phase
// ============================================================================

/// First packet a client may send on a fresh connection.
#[derive(Debug)]
pub enum StartupPacket {
    /// StartupMessage parameters (protocol 3.0)
    Startup(HashMap<String, String>),
    SslRequest,
    GssEncRequest,
    Cancel(CancelData),
}

/// Read one untyped startup-phase packet.
pub async fn read_startup_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<StartupPacket> {
    let length = read_u32_be(reader).await?;

    if length < 8 {
        return Err(ProxyError::Framing(format!(
            "startup packet too short: {} bytes",
            length
        )));
    }
    if length > MAX_STARTUP_PACKET_SIZE {
        return Err(ProxyError::Framing(format!(
            "startup packet too large: {} bytes (max {})",
            length, MAX_STARTUP_PACKET_SIZE
        )));
    }

    let mut code = [0u8; 4];
    read_body(reader, &mut code).await?;
    let code = u32::from_be_bytes(code);

    match code {
        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
            if length != SECURITY_REQUEST_LEN {
                return Err(ProxyError::Framing(format!(
                    "encryption request with invalid length {}",
                    length
                )));
            }
            Ok(if code == SSL_REQUEST_CODE {
                StartupPacket::SslRequest
            } else {
                StartupPacket::GssEncRequest
            })
        }
        CANCEL_REQUEST_CODE => {
            if length != CANCEL_REQUEST_LEN {
                return Err(ProxyError::Framing(format!(
                    "CancelRequest with invalid length {}",
                    length
                )));
            }
            let mut packet = [0u8; 16];
            packet[0..4].copy_from_slice(&length.to_be_bytes());
            packet[4..8].copy_from_slice(&code.to_be_bytes());
            read_body(reader, &mut packet[8..]).await?;
            Ok(StartupPacket::Cancel(CancelData::decode(&packet)?))
        }
        PROTOCOL_VERSION_3_0 => {
            let mut buf = vec![0u8; (length - 8) as usize];
            read_body(reader, &mut buf).await?;
            Ok(StartupPacket::Startup(parse_startup_parameters(&buf)?))
        }
        other => Err(ProxyError::Framing(format!(
            "unsupported protocol version {}.{}",
            other >> 16,
            other & 0xFFFF
        ))),
    }
}

/// Parse `key\0value\0...\0` pairs from a StartupMessage body.
fn parse_startup_parameters(buf: &[u8]) -> Result<HashMap<String, String>> {
    let mut parameters = HashMap::new();
    let mut offset = 0;

    loop {
        if offset >= buf.len() {
            return Err(ProxyError::Framing(
                "StartupMessage missing final terminator".into(),
            ));
        }
        let (key, key_len) = read_cstring_from_buf(buf, offset)?;
        offset += key_len;
        if key.is_empty() {
            return Ok(parameters);
        }

        let (value, value_len) = read_cstring_from_buf(buf, offset)
            .map_err(|_| ProxyError::Framing(format!("missing value for parameter {}", key)))?;
        offset += value_len;
        parameters.insert(key, value);
    }
}

/// Write a protocol 3.0 StartupMessage.
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    parameters: &[(&str, &str)],
) -> Result<()> {
    let mut content = Vec::new();
    content.extend_from_slice(&PROTOCOL_VERSION_3_0.to_be_bytes());
    for (key, value) in parameters {
        content.extend_from_slice(key.as_bytes());
        content.push(0);
        content.extend_from_slice(value.as_bytes());
        content.push(0);
    }
    content.push(0);

    let length = (content.len() + 4) as u32;
    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&content).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an SSLRequest.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&SECURITY_REQUEST_LEN.to_be_bytes());
    buf[4..8].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a 16-byte CancelRequest.
pub async fn write_cancel_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cancel: &CancelData,
) -> Result<()> {
    writer.write_all(&cancel.encode()).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Typed messages
// ============================================================================

/// Read a typed message, returning the type byte and the payload.
///
/// A peer that closes the connection between messages yields
/// `ProxyError::Io` with `UnexpectedEof`; a message cut short yields
/// `ProxyError::Framing`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    read_message_with_limit(reader, MAX_MESSAGE_SIZE).await
}

/// Like [`read_message`], rejecting any declared length above `max_size`
/// before the payload buffer is allocated.
pub async fn read_message_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> Result<(u8, Vec<u8>)> {
    let mut msg_type = [0u8; 1];
    reader.read_exact(&mut msg_type).await?;

    let mut length = [0u8; 4];
    read_body(reader, &mut length).await?;
    let length = u32::from_be_bytes(length);

    if length < MIN_MESSAGE_LENGTH {
        return Err(ProxyError::Framing(format!(
            "invalid message length {}",
            length
        )));
    }
    if length > max_size {
        return Err(ProxyError::Framing(format!(
            "message too large: {} bytes (max {})",
            length, max_size
        )));
    }

    let mut payload = vec![0u8; (length - 4) as usize];
    if !payload.is_empty() {
        read_body(reader, &mut payload).await?;
    }
    Ok((msg_type[0], payload))
}

/// Read a typed message that must be of type `msg_type`.
///
/// `describe` names message types for the error (frontend or backend table).
pub async fn expect_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    msg_type: u8,
    describe: fn(u8) -> &'static str,
) -> Result<Vec<u8>> {
    expect_message_with_limit(reader, msg_type, describe, MAX_MESSAGE_SIZE).await
}

/// [`expect_message`] with an explicit size cap, for reads from peers that
/// have not authenticated yet.
pub async fn expect_message_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    msg_type: u8,
    describe: fn(u8) -> &'static str,
    max_size: u32,
) -> Result<Vec<u8>> {
    let (actual, payload) = read_message_with_limit(reader, max_size).await?;
    if actual != msg_type {
        return Err(ProxyError::UnexpectedMessage {
            expected: describe(msg_type),
            actual: format!("{} ('{}')", describe(actual), actual as char),
        });
    }
    Ok(payload)
}

/// Write a typed message and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> Result<()> {
    let mut header = [0u8; 5];
    header[0] = msg_type;
    header[1..].copy_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Send a FATAL ErrorResponse built from a proxy error.
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    err: &ProxyError,
) -> Result<()> {
    let payload = build_error_response(&ErrorNoticeResponse::from_error(err));
    write_message(writer, MSG_ERROR_RESPONSE, &payload).await
}

// ============================================================================
// Parsers
// ============================================================================

/// Parse an Authentication ('R') payload.
pub fn parse_authentication(payload: &[u8]) -> Result<AuthenticationMessage> {
    let code = be_u32_at(payload, 0)
        .ok_or_else(|| ProxyError::Framing("authentication message too short".into()))?;

    match code {
        AUTH_OK => Ok(AuthenticationMessage::Ok),
        AUTH_CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
        AUTH_MD5_PASSWORD => {
            let salt: [u8; 4] = payload
                .get(4..8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| ProxyError::Framing("MD5 request missing salt".into()))?;
            Ok(AuthenticationMessage::Md5Password { salt })
        }
        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            let mut offset = 4;
            while offset < payload.len() {
                let (mechanism, len) = read_cstring_from_buf(payload, offset)?;
                offset += len;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Ok(AuthenticationMessage::Sasl { mechanisms })
        }
        AUTH_SASL_CONTINUE => Ok(AuthenticationMessage::SaslContinue {
            data: payload[4..].to_vec(),
        }),
        AUTH_SASL_FINAL => Ok(AuthenticationMessage::SaslFinal {
            data: payload[4..].to_vec(),
        }),
        other => Ok(AuthenticationMessage::Unsupported(other)),
    }
}

/// Parse an ErrorResponse or NoticeResponse payload.
pub fn parse_error_notice(payload: &[u8]) -> Result<ErrorNoticeResponse> {
    let mut response = ErrorNoticeResponse::new();
    let mut offset = 0;

    while offset < payload.len() {
        let field_type = payload[offset];
        offset += 1;
        if field_type == 0 {
            break;
        }
        let (value, len) = read_cstring_from_buf(payload, offset)?;
        offset += len;
        response.set_field(field_type, &value);
    }
    Ok(response)
}

pub fn parse_parameter_status(payload: &[u8]) -> Result<ParameterStatus> {
    let (name, name_len) = read_cstring_from_buf(payload, 0)?;
    let (value, _) = read_cstring_from_buf(payload, name_len)?;
    Ok(ParameterStatus { name, value })
}

pub fn parse_backend_key_data(payload: &[u8]) -> Result<BackendKeyData> {
    match (be_u32_at(payload, 0), be_u32_at(payload, 4)) {
        (Some(process_id), Some(secret_key)) => Ok(BackendKeyData::new(process_id, secret_key)),
        _ => Err(ProxyError::Framing(format!(
            "BackendKeyData too short: {} bytes",
            payload.len()
        ))),
    }
}

pub fn parse_ready_for_query(payload: &[u8]) -> Result<TransactionStatus> {
    let byte = *payload
        .first()
        .ok_or_else(|| ProxyError::Framing("ReadyForQuery missing status".into()))?;
    TransactionStatus::from_byte(byte)
        .ok_or_else(|| ProxyError::Framing(format!("invalid transaction status 0x{:02X}", byte)))
}

/// Extract the password from a PasswordMessage ('p') payload.
pub fn parse_password_message(payload: &[u8]) -> Result<String> {
    let (password, len) = read_cstring_from_buf(payload, 0)?;
    if len != payload.len() {
        return Err(ProxyError::Framing(
            "trailing bytes after password".into(),
        ));
    }
    Ok(password)
}

// ============================================================================
// Builders
// ============================================================================

/// PasswordMessage payload carrying a cleartext or MD5 password.
pub fn build_password_message(password: &str) -> Vec<u8> {
    let mut payload = password.as_bytes().to_vec();
    payload.push(0);
    payload
}

/// SASLInitialResponse payload: mechanism, then length-prefixed data.
pub fn build_sasl_initial_response(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(mechanism.len() + 5 + data.len());
    payload.extend_from_slice(mechanism.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&(data.len() as i32).to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

/// SASLResponse payload (raw data).
pub fn build_sasl_response(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

pub fn build_auth_ok() -> Vec<u8> {
    AUTH_OK.to_be_bytes().to_vec()
}

pub fn build_auth_cleartext_password() -> Vec<u8> {
    AUTH_CLEARTEXT_PASSWORD.to_be_bytes().to_vec()
}

/// ErrorResponse payload. Severity, SQLSTATE and message are written first,
/// remaining fields follow in byte order.
pub fn build_error_response(response: &ErrorNoticeResponse) -> Vec<u8> {
    const LEADING: [u8; 4] = [
        ERROR_FIELD_SEVERITY,
        ERROR_FIELD_SEVERITY_V,
        ERROR_FIELD_CODE,
        ERROR_FIELD_MESSAGE,
    ];

    let mut rest: Vec<u8> = response
        .fields
        .keys()
        .copied()
        .filter(|k| !LEADING.contains(k))
        .collect();
    rest.sort_unstable();

    let mut payload = Vec::new();
    for field_type in LEADING.iter().chain(rest.iter()) {
        if let Some(value) = response.fields.get(field_type) {
            payload.push(*field_type);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
    }
    payload.push(0);
    payload
}
