//! Scripted PostgreSQL backend and client helpers shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use pgrelay::protocol::postgres::codec::{
    build_auth_cleartext_password, build_auth_ok, build_password_message, expect_message,
    parse_authentication, parse_backend_key_data, parse_error_notice, parse_password_message,
    read_message, read_startup_packet, write_message, write_startup_message,
};
use pgrelay::protocol::postgres::constants::*;
use pgrelay::protocol::postgres::{
    AuthenticationMessage, BackendKeyData, CancelData, ErrorNoticeResponse, StartupPacket,
};
use pgrelay::{Proxy, ProxyOptions, TcpDialer};

/// Default test timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Key data the fake backend hands out
pub const BACKEND_PID: u32 = 42;
pub const BACKEND_SECRET: u32 = 99;

/// What the fake backend observed.
#[derive(Debug)]
pub enum BackendEvent {
    Startup {
        parameters: HashMap<String, String>,
        password: Option<String>,
    },
    Cancel(CancelData),
}

/// Start a backend that greets every session with ParameterStatus,
/// BackendKeyData(42, 99) and ReadyForQuery, answers every Query with
/// CommandComplete + ReadyForQuery and closes on Terminate.
pub async fn start_fake_backend(
    ask_password: bool,
) -> (SocketAddr, mpsc::UnboundedReceiver<BackendEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = serve_backend_connection(stream, ask_password, tx).await;
            });
        }
    });

    (addr, rx)
}

async fn serve_backend_connection(
    mut stream: TcpStream,
    ask_password: bool,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> pgrelay::Result<()> {
    let parameters = match read_startup_packet(&mut stream).await? {
        StartupPacket::Startup(parameters) => parameters,
        StartupPacket::Cancel(cancel) => {
            let _ = events.send(BackendEvent::Cancel(cancel));
            return Ok(());
        }
        other => panic!("fake backend got {:?}", other),
    };

    let password = if ask_password {
        write_message(&mut stream, MSG_AUTH_REQUEST, &build_auth_cleartext_password()).await?;
        let payload = expect_message(&mut stream, MSG_PASSWORD, frontend_message_name).await?;
        Some(parse_password_message(&payload)?)
    } else {
        None
    };
    let _ = events.send(BackendEvent::Startup {
        parameters,
        password,
    });

    write_message(&mut stream, MSG_AUTH_REQUEST, &build_auth_ok()).await?;
    write_message(&mut stream, MSG_PARAMETER_STATUS, b"server_version\x0016.2\x00").await?;
    let mut key = BACKEND_PID.to_be_bytes().to_vec();
    key.extend_from_slice(&BACKEND_SECRET.to_be_bytes());
    write_message(&mut stream, MSG_BACKEND_KEY_DATA, &key).await?;
    write_message(&mut stream, MSG_READY_FOR_QUERY, b"I").await?;

    loop {
        let (msg_type, _) = read_message(&mut stream).await?;
        match msg_type {
            MSG_QUERY => {
                write_message(&mut stream, MSG_COMMAND_COMPLETE, b"SELECT 1\0").await?;
                write_message(&mut stream, MSG_READY_FOR_QUERY, b"I").await?;
            }
            MSG_TERMINATE => return Ok(()),
            _ => {}
        }
    }
}

/// Wait for the next backend event.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<BackendEvent>) -> BackendEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for backend")
        .expect("backend event channel closed")
}

/// A proxy serving on an ephemeral port.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub proxy: Proxy,
    pub shutdown: broadcast::Sender<()>,
    pub handle: JoinHandle<pgrelay::Result<()>>,
}

pub async fn start_proxy(dialer: TcpDialer, options: ProxyOptions) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Proxy::new(Arc::new(dialer), options);
    let (shutdown, shutdown_rx) = broadcast::channel(1);

    let serving = proxy.clone();
    let handle = tokio::spawn(async move { serving.serve(listener, shutdown_rx).await });

    RunningProxy {
        addr,
        proxy,
        shutdown,
        handle,
    }
}

pub fn dialer_for(backend: SocketAddr) -> TcpDialer {
    TcpDialer::new(&backend.ip().to_string(), backend.port())
}

/// Send a StartupMessage and run the client side of the handshake through
/// ReadyForQuery. Returns the key data the proxy relayed.
pub async fn client_startup<S>(
    stream: &mut S,
    user: &str,
    database: &str,
    password: Option<&str>,
) -> BackendKeyData
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_startup_message(stream, &[("user", user), ("database", database)])
        .await
        .unwrap();

    let mut key_data = None;
    loop {
        let (msg_type, payload) = timeout(TEST_TIMEOUT, read_message(stream))
            .await
            .expect("timed out waiting for proxy")
            .unwrap();
        match msg_type {
            MSG_AUTH_REQUEST => match parse_authentication(&payload).unwrap() {
                AuthenticationMessage::CleartextPassword => {
                    let password = password.expect("proxy asked for a password");
                    write_message(stream, MSG_PASSWORD, &build_password_message(password))
                        .await
                        .unwrap();
                }
                AuthenticationMessage::Ok => {}
                other => panic!("unexpected authentication request {:?}", other),
            },
            MSG_BACKEND_KEY_DATA => key_data = Some(parse_backend_key_data(&payload).unwrap()),
            MSG_READY_FOR_QUERY => break,
            MSG_ERROR_RESPONSE => panic!("startup failed: {:?}", parse_error_notice(&payload)),
            _ => {}
        }
    }
    key_data.expect("no BackendKeyData relayed")
}

/// Send a StartupMessage and expect a FATAL ErrorResponse.
pub async fn client_startup_error<S>(stream: &mut S, user: &str, database: &str) -> ErrorNoticeResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_startup_message(stream, &[("user", user), ("database", database)])
        .await
        .unwrap();
    let payload = timeout(
        TEST_TIMEOUT,
        expect_message(stream, MSG_ERROR_RESPONSE, backend_message_name),
    )
    .await
    .expect("timed out waiting for proxy")
    .unwrap();
    parse_error_notice(&payload).unwrap()
}

/// Poll `check` until it holds or the test timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
