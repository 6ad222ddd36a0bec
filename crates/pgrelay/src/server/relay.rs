//! Steady-state relay between an authenticated client and its backend
//!
//! Client → backend runs on the connection's task and is framed, so the
//! relay sees Terminate and can end the session cleanly. Backend → client is
//! a raw byte copy on its own task.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};
use crate::protocol::postgres::codec::{read_message, write_message};
use crate::protocol::postgres::constants::{frontend_message_name, MSG_TERMINATE};

/// Time the backend → client copy may keep running after Terminate
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay session between a client and a backend.
pub struct Session<C, B> {
    client: C,
    backend: B,
    drain_timeout: Duration,
}

impl<C, B> Session<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(client: C, backend: B) -> Self {
        Self {
            client,
            backend,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Relay until the session ends.
    ///
    /// - Client sends Terminate: forwarded, then `Ok`. Closed-connection
    ///   errors from the backend → client side are ignored from then on.
    /// - Backend closes first: `Ok`.
    /// - Any other error on either side is returned.
    pub async fn relay(self) -> Result<()> {
        let (mut client_read, client_write) = split(self.client);
        let (backend_read, mut backend_write) = split(self.backend);
        let client_done = Arc::new(AtomicBool::new(false));

        let mut backend_to_client = tokio::spawn(copy_backend_to_client(
            backend_read,
            client_write,
            Arc::clone(&client_done),
        ));

        let client_to_backend = forward_client(&mut client_read, &mut backend_write, &client_done);
        tokio::pin!(client_to_backend);

        tokio::select! {
            result = &mut client_to_backend => {
                if let Err(e) = result {
                    backend_to_client.abort();
                    return Err(e);
                }

                match timeout(self.drain_timeout, &mut backend_to_client).await {
                    Ok(joined) => finish_backend_to_client(joined),
                    Err(_) => {
                        debug!("Backend output not drained after {:?}, aborting", self.drain_timeout);
                        backend_to_client.abort();
                        Ok(())
                    }
                }
            }
            joined = &mut backend_to_client => {
                debug!("Backend side finished before client sent Terminate");
                finish_backend_to_client(joined)
            }
        }
    }
}

fn finish_backend_to_client(
    joined: std::result::Result<io::Result<u64>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(bytes)) => {
            trace!("backend->client: {} bytes total", bytes);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(ProxyError::Connection(format!(
            "backend->client task failed: {}",
            e
        ))),
    }
}

/// Forward framed client messages until Terminate.
///
/// `client_done` is raised before Terminate reaches the backend, so the
/// backend → client side already tolerates the backend hanging up on it.
async fn forward_client<R, W>(
    client: &mut R,
    backend: &mut W,
    client_done: &AtomicBool,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (msg_type, payload) = read_message(client).await?;
        trace!(
            "client->backend: {} ({} bytes)",
            frontend_message_name(msg_type),
            payload.len()
        );
        if msg_type == MSG_TERMINATE {
            client_done.store(true, Ordering::SeqCst);
        }
        write_message(backend, msg_type, &payload).await?;

        if msg_type == MSG_TERMINATE {
            debug!("Client sent Terminate");
            // Backend may already be gone; Terminate was delivered or moot.
            let _ = backend.shutdown().await;
            return Ok(());
        }
    }
}

/// The peer went away; not a failure once the client has terminated.
pub(crate) fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

async fn copy_backend_to_client<R, W>(
    mut backend: R,
    mut client: W,
    client_done: Arc<AtomicBool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut total = 0u64;

    let result = async {
        loop {
            let n = backend.read(&mut buf).await?;
            if n == 0 {
                debug!("backend->client: EOF after {} bytes", total);
                return Ok(());
            }
            client.write_all(&buf[..n]).await?;
            client.flush().await?;
            total += n as u64;
        }
    }
    .await;

    let _ = client.shutdown().await;

    match result {
        Ok(()) => Ok(total),
        Err(e) if client_done.load(Ordering::SeqCst) && is_closed_connection(&e) => {
            trace!("backend->client: ignoring {} after Terminate", e);
            Ok(total)
        }
        Err(e) => Err(e),
    }
}
