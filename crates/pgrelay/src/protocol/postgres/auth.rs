//! Backend authentication helpers
//!
//! - MD5 password hashing
//! - SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding
//!
//! The SCRAM engine never touches the network. The handshake code feeds it
//! the payloads of AuthenticationSASLContinue / AuthenticationSASLFinal and
//! sends what it returns.
//!
//! References:
//! - <https://www.postgresql.org/docs/current/auth-password.html>
//! - <https://www.postgresql.org/docs/current/sasl-authentication.html>

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::constants::SASL_MECHANISM_SCRAM_SHA_256;
use crate::error::{ProxyError, Result};

// ============================================================================
// MD5
// ============================================================================

/// Compute the response to AuthenticationMD5Password.
///
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
///
/// # Arguments
///
/// * `user` - Username from the StartupMessage
/// * `password` - Cleartext password captured from the client
/// * `salt` - 4-byte salt from the AuthenticationMD5Password request
///
/// # Example
///
/// ```
/// use pgrelay::protocol::postgres::compute_md5_password;
///
/// let response = compute_md5_password("alice", "secret", &[1, 2, 3, 4]);
/// assert!(response.starts_with("md5"));
/// assert_eq!(response.len(), 35);
/// ```
pub fn compute_md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex_encode(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// SCRAM-SHA-256
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Raw nonce length before base64
const NONCE_LEN: usize = 18;

/// GS2 header for "no channel binding, no authzid", and its base64 form
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "biws";

/// Client side of a SCRAM-SHA-256 exchange.
///
/// The exchange runs in three calls, each fed the payload of the matching
/// backend message:
///
/// 1. [`client_first_message`](Self::client_first_message) for
///    SASLInitialResponse
/// 2. [`process_server_first`](Self::process_server_first) with the
///    AuthenticationSASLContinue data, for SASLResponse
/// 3. [`verify_server_final`](Self::verify_server_final) with the
///    AuthenticationSASLFinal data
///
/// The user name is left empty (`n=`); PostgreSQL takes it from the
/// StartupMessage.
///
/// # Errors
///
/// * `UnsupportedMechanism` - `SCRAM-SHA-256` was not offered
/// * `MalformedServerMessage`, `InvalidNonce`, `InvalidIterationCount` -
///   the server-first-message failed validation
/// * `ServerSignatureMismatch` - the server could not prove it knows the
///   password
/// * `ScramServerError` - the server answered with `e=<reason>`
/// * `Protocol` - a step was called out of order
///
/// # Example
///
/// ```
/// use pgrelay::protocol::postgres::ScramClient;
///
/// let offered = vec!["SCRAM-SHA-256".to_string()];
/// let mut scram = ScramClient::new(&offered, "secret")?;
/// let first = scram.client_first_message()?;
/// assert!(first.starts_with(b"n,,n=,r="));
/// # Ok::<(), pgrelay::ProxyError>(())
/// ```
pub struct ScramClient {
    /// SASLprep-normalized password bytes
    password: Zeroizing<Vec<u8>>,
    client_nonce: String,
    state: ScramState,
}

enum ScramState {
    Initial,
    WaitingForServerFirst {
        client_first_bare: String,
    },
    WaitingForServerFinal {
        auth_message: String,
        salted_password: Zeroizing<[u8; 32]>,
    },
    Complete,
    Failed,
}

/// Fields of a server-first-message.
#[derive(Debug, PartialEq, Eq)]
struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ScramClient {
    /// Start an exchange against the mechanisms advertised in
    /// AuthenticationSASL.
    ///
    /// Fails with `UnsupportedMechanism` unless `SCRAM-SHA-256` is offered.
    pub fn new(mechanisms: &[String], password: &str) -> Result<Self> {
        if !mechanisms
            .iter()
            .any(|m| m == SASL_MECHANISM_SCRAM_SHA_256)
        {
            return Err(ProxyError::UnsupportedMechanism(mechanisms.to_vec()));
        }
        Ok(Self::with_nonce(password, generate_nonce()))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        // Passwords that SASLprep rejects are used as raw bytes, as libpq does.
        let normalized = match stringprep::saslprep(password) {
            Ok(prepped) => prepped.as_bytes().to_vec(),
            Err(_) => password.as_bytes().to_vec(),
        };
        Self {
            password: Zeroizing::new(normalized),
            client_nonce,
            state: ScramState::Initial,
        }
    }

    /// Mechanism name for SASLInitialResponse.
    pub fn mechanism(&self) -> &'static str {
        SASL_MECHANISM_SCRAM_SHA_256
    }

    /// Step 1: client-first-message, `n,,n=,r=<nonce>`.
    pub fn client_first_message(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.state, ScramState::Initial) {
            return Err(self.fail("client-first-message already sent"));
        }
        let client_first_bare = format!("n=,r={}", self.client_nonce);
        let message = format!("{}{}", GS2_HEADER, client_first_bare);
        self.state = ScramState::WaitingForServerFirst { client_first_bare };
        Ok(message.into_bytes())
    }

    /// Steps 2 and 3: validate server-first-message and build
    /// client-final-message, `c=biws,r=<combined>,p=<proof>`.
    pub fn process_server_first(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let client_first_bare = match std::mem::replace(&mut self.state, ScramState::Failed) {
            ScramState::WaitingForServerFirst { client_first_bare } => client_first_bare,
            _ => return Err(self.fail("server-first-message received out of order")),
        };

        let server_first = std::str::from_utf8(server_first).map_err(|_| {
            ProxyError::MalformedServerMessage("server-first-message is not UTF-8".into())
        })?;
        let parsed = parse_server_first(server_first)?;

        if parsed.nonce.len() <= self.client_nonce.len()
            || !parsed.nonce.starts_with(&self.client_nonce)
        {
            return Err(ProxyError::InvalidNonce);
        }

        let mut salted_password = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            &self.password,
            &parsed.salt,
            parsed.iterations,
            &mut *salted_password,
        );

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, parsed.nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_key = Zeroizing::new(hmac_sha256(&salted_password[..], b"Client Key")?);
        let stored_key = sha256(&client_key[..]);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = ScramState::WaitingForServerFinal {
            auth_message,
            salted_password,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Step 4: check the server signature in `v=<signature>`.
    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<()> {
        let (auth_message, salted_password) =
            match std::mem::replace(&mut self.state, ScramState::Failed) {
                ScramState::WaitingForServerFinal {
                    auth_message,
                    salted_password,
                } => (auth_message, salted_password),
                _ => return Err(self.fail("server-final-message received out of order")),
            };

        let server_final = std::str::from_utf8(server_final).map_err(|_| {
            ProxyError::MalformedServerMessage("server-final-message is not UTF-8".into())
        })?;
        let first = server_final.split(',').next().unwrap_or_default();

        if let Some(reason) = first.strip_prefix("e=") {
            return Err(ProxyError::ScramServerError(reason.to_string()));
        }
        let signature = first
            .strip_prefix("v=")
            .ok_or_else(|| {
                ProxyError::MalformedServerMessage(format!(
                    "expected v= in server-final-message, got {:?}",
                    server_final
                ))
            })
            .and_then(|v| {
                BASE64.decode(v).map_err(|_| {
                    ProxyError::MalformedServerMessage("server signature is not base64".into())
                })
            })?;

        let server_key = hmac_sha256(&salted_password[..], b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if bool::from(signature.ct_eq(&expected)) {
            self.state = ScramState::Complete;
            Ok(())
        } else {
            Err(ProxyError::ServerSignatureMismatch)
        }
    }

    /// True once the server signature has been verified.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ScramState::Complete)
    }

    fn fail(&mut self, reason: &str) -> ProxyError {
        self.state = ScramState::Failed;
        ProxyError::Protocol(format!("SCRAM: {}", reason))
    }
}

fn generate_nonce() -> String {
    let raw: [u8; NONCE_LEN] = rand::thread_rng().gen();
    BASE64.encode(raw)
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>[,ext...]`, fields in that order.
fn parse_server_first(msg: &str) -> Result<ServerFirst> {
    if let Some(reason) = msg.strip_prefix("e=") {
        return Err(ProxyError::ScramServerError(reason.to_string()));
    }

    let mut parts = msg.split(',');
    let mut field = |prefix: &str| {
        parts
            .next()
            .and_then(|part| part.strip_prefix(prefix))
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::MalformedServerMessage(format!(
                    "expected {} in server-first-message",
                    prefix
                ))
            })
    };

    let nonce = field("r=")?;
    let salt = field("s=")?;
    let iterations = field("i=")?;

    let salt = BASE64
        .decode(salt)
        .map_err(|_| ProxyError::MalformedServerMessage("salt is not base64".into()))?;
    let iterations = match iterations.parse::<u32>() {
        Ok(n) if n > 0 => n,
        _ => return Err(ProxyError::InvalidIterationCount(iterations)),
    };

    Ok(ServerFirst {
        nonce,
        salt,
        iterations,
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProxyError::Protocol(format!("HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}


#[cfg(test)]
mod tests {
    use super::test_server::TestServer;
    use super::*;

    fn scram_mechanisms() -> Vec<String> {
        vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()]
    }

    #[test]
    fn test_md5_password_known_value() {
        let hash = compute_md5_password("alice", "wonderland", &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(hash.len(), 35);

        let inner = hex_encode(&Md5::digest(b"wonderlandalice"));
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(hash, format!("md5{}", hex_encode(&Md5::digest(&outer))));
    }

    #[test]
    fn test_md5_password_depends_on_salt() {
        let a = compute_md5_password("alice", "wonderland", &[0, 0, 0, 0]);
        let b = compute_md5_password("alice", "wonderland", &[0, 0, 0, 1]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unsupported_mechanism() {
        let offered = vec!["SCRAM-SHA-256-PLUS".to_string()];
        match ScramClient::new(&offered, "pw") {
            Err(ProxyError::UnsupportedMechanism(m)) => assert_eq!(m, offered),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected UnsupportedMechanism"),
        }
    }

    #[test]
    fn test_client_first_message() {
        let mut client = ScramClient::new(&scram_mechanisms(), "pencil").unwrap();
        let first = String::from_utf8(client.client_first_message().unwrap()).unwrap();
        let nonce = first.strip_prefix("n,,n=,r=").unwrap();
        assert_eq!(nonce.len(), 24);
        assert_eq!(BASE64.decode(nonce).unwrap().len(), NONCE_LEN);
    }

    #[test]
    fn test_nonces_differ() {
        let mut a = ScramClient::new(&scram_mechanisms(), "pw").unwrap();
        let mut b = ScramClient::new(&scram_mechanisms(), "pw").unwrap();
        assert_ne!(
            a.client_first_message().unwrap(),
            b.client_first_message().unwrap()
        );
    }

    #[test]
    fn test_full_exchange() {
        let server = TestServer::new("pencil");
        let mut client = ScramClient::new(&scram_mechanisms(), "pencil").unwrap();

        let client_first = client.client_first_message().unwrap();
        let (bare, server_first) = server.server_first(&client_first, "srvnonce");
        let client_final = client.process_server_first(server_first.as_bytes()).unwrap();
        assert!(client_final.starts_with(b"c=biws,r="));

        let server_final = server.server_final(&bare, &server_first, &client_final);
        client.verify_server_final(server_final.as_bytes()).unwrap();
        assert!(client.is_complete());
    }

    #[test]
    fn test_full_exchange_any_salt_and_iterations() {
        for salt_len in [0usize, 1, 16, 64] {
            let salt: Vec<u8> = (0..salt_len).map(|i| (i * 7) as u8).collect();
            for iterations in [1u32, 2, 4096] {
                let server = TestServer::with_salt("pencil", &salt, iterations);
                let mut client = ScramClient::new(&scram_mechanisms(), "pencil").unwrap();

                let client_first = client.client_first_message().unwrap();
                let (bare, server_first) = server.server_first(&client_first, "srv");
                let client_final = client.process_server_first(server_first.as_bytes()).unwrap();
                let server_final = server.server_final(&bare, &server_first, &client_final);
                client.verify_server_final(server_final.as_bytes()).unwrap();
                assert!(
                    client.is_complete(),
                    "salt {} bytes, {} iterations",
                    salt_len,
                    iterations
                );
            }
        }
    }

    #[test]
    fn test_full_exchange_with_saslprep() {
        // U+00A0 (no-break space) maps to U+0020 under SASLprep
        let server = TestServer::new("pen cil");
        let mut client = ScramClient::new(&scram_mechanisms(), "pen\u{00A0}cil").unwrap();

        let client_first = client.client_first_message().unwrap();
        let (bare, server_first) = server.server_first(&client_first, "x");
        let client_final = client.process_server_first(server_first.as_bytes()).unwrap();
        let server_final = server.server_final(&bare, &server_first, &client_final);
        client.verify_server_final(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let server = TestServer::new("pencil");
        let mut client = ScramClient::new(&scram_mechanisms(), "pencil").unwrap();
        let client_first = client.client_first_message().unwrap();
        let (_, server_first) = server.server_first(&client_first, "srv");
        client.process_server_first(server_first.as_bytes()).unwrap();

        let bogus = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(matches!(
            client.verify_server_final(bogus.as_bytes()),
            Err(ProxyError::ServerSignatureMismatch)
        ));
        assert!(!client.is_complete());
    }

    #[test]
    fn test_server_final_error() {
        let mut client = ScramClient::with_nonce("pw", "abc".into());
        client.client_first_message().unwrap();
        client
            .process_server_first(b"r=abcdef,s=c2FsdA==,i=1")
            .unwrap();
        match client.verify_server_final(b"e=invalid-proof") {
            Err(ProxyError::ScramServerError(reason)) => assert_eq!(reason, "invalid-proof"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_nonce_must_strictly_extend() {
        for server_first in [
            &b"r=abc,s=c2FsdA==,i=4096"[..],
            &b"r=xyzdef,s=c2FsdA==,i=4096"[..],
            &b"r=ab,s=c2FsdA==,i=4096"[..],
        ] {
            let mut client = ScramClient::with_nonce("pw", "abc".into());
            client.client_first_message().unwrap();
            assert!(matches!(
                client.process_server_first(server_first),
                Err(ProxyError::InvalidNonce)
            ));
        }
    }

    #[test]
    fn test_iteration_count_must_be_positive() {
        for iterations in ["0", "-5", "lots", "99999999999"] {
            let mut client = ScramClient::with_nonce("pw", "abc".into());
            client.client_first_message().unwrap();
            let msg = format!("r=abcdef,s=c2FsdA==,i={}", iterations);
            match client.process_server_first(msg.as_bytes()) {
                Err(ProxyError::InvalidIterationCount(v)) => assert_eq!(v, iterations),
                other => panic!("unexpected for {iterations}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_server_first() {
        let parsed = parse_server_first("r=nonce123,s=c2FsdA==,i=4096,m=ext").unwrap();
        assert_eq!(
            parsed,
            ServerFirst {
                nonce: "nonce123".into(),
                salt: b"salt".to_vec(),
                iterations: 4096,
            }
        );
    }

    #[test]
    fn test_parse_server_first_malformed() {
        for msg in [
            "s=c2FsdA==,r=nonce,i=4096",
            "r=nonce,i=4096,s=c2FsdA==",
            "r=nonce,s=c2FsdA==",
            "r=nonce,s=!!!,i=4096",
            "",
        ] {
            assert!(
                matches!(
                    parse_server_first(msg),
                    Err(ProxyError::MalformedServerMessage(_))
                ),
                "{msg:?} should be malformed"
            );
        }
        assert!(matches!(
            parse_server_first("e=other-error"),
            Err(ProxyError::ScramServerError(_))
        ));
    }

    #[test]
    fn test_steps_out_of_order() {
        let mut client = ScramClient::with_nonce("pw", "abc".into());
        assert!(matches!(
            client.process_server_first(b"r=abcdef,s=c2FsdA==,i=1"),
            Err(ProxyError::Protocol(_))
        ));

        let mut client = ScramClient::with_nonce("pw", "abc".into());
        client.client_first_message().unwrap();
        assert!(matches!(
            client.verify_server_final(b"v=AAAA"),
            Err(ProxyError::Protocol(_))
        ));
        assert!(matches!(
            client.client_first_message(),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_hmac_sha256_vector() {
        let result = hmac_sha256(b"key", b"message").unwrap();
        assert_eq!(
            hex_encode(&result),
            "6e9ef29b75fffc5b7abae527d58fdadb2fe42e7219011976917343065f58ed4a"
        );
    }
}
