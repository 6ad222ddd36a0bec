//! Accept loop, per-connection dispatch and cancel routing

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

use super::backend::DialBackend;
use super::handshake::{ClientHandshake, ClientNegotiator, ServerHandshake, ServerNegotiator};
use super::registry::KeyDataRegistry;
use super::relay::{Session, DEFAULT_DRAIN_TIMEOUT};
use super::stream::NetworkStream;
use crate::error::{ProxyError, Result};
use crate::protocol::postgres::codec::write_error_response;
use crate::protocol::postgres::{BackendKeyData, CancelData, Hello, StartupData};
use crate::tls::{TlsAcceptor, TlsConnector};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// CancelRequests forwarded to a backend
    pub cancels_routed: AtomicU64,
    /// CancelRequests with no matching session
    pub cancels_unmatched: AtomicU64,
}

/// Proxy settings supplied by the host.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Accept TLS from clients; `None` answers SSLRequests with `N`
    pub client_tls: Option<TlsAcceptor>,
    /// Request TLS from the backend, verifying it as the given server name
    pub backend_tls: Option<(TlsConnector, String)>,
    /// Ask clients for a cleartext password to relay to the backend
    pub request_password: bool,
    /// Close the listener if no client connects within this window
    pub idle_timeout: Duration,
    /// Upper bound for each handshake phase and for dialing
    pub handshake_timeout: Duration,
    /// Time the backend may keep sending after the client terminated
    pub drain_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            client_tls: None,
            backend_tls: None,
            request_password: false,
            idle_timeout: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(30),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Source of client connections.
#[async_trait]
pub trait ConnectionSource: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl ConnectionSource for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }
}

/// Single-backend proxy.
///
/// Cloning is cheap; every connection task holds a clone.
#[derive(Clone)]
pub struct Proxy {
    client: ClientNegotiator,
    server: ServerNegotiator,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    drain_timeout: Duration,
    dialer: Arc<dyn DialBackend>,
    registry: Arc<KeyDataRegistry>,
    stats: Arc<ListenerStats>,
}

impl Proxy {
    pub fn new(dialer: Arc<dyn DialBackend>, options: ProxyOptions) -> Self {
        let server = match options.backend_tls {
            Some((connector, server_name)) => ServerNegotiator::new().with_tls(connector, server_name),
            None => ServerNegotiator::new(),
        };

        Self {
            client: ClientNegotiator::new(options.client_tls, options.request_password),
            server,
            idle_timeout: options.idle_timeout,
            handshake_timeout: options.handshake_timeout,
            drain_timeout: options.drain_timeout,
            dialer,
            registry: Arc::new(KeyDataRegistry::new()),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Get listener statistics
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Sessions currently reachable by a CancelRequest
    pub fn registry(&self) -> Arc<KeyDataRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the accept loop.
    ///
    /// Each accepted connection gets its own task. Temporary accept errors
    /// (descriptor exhaustion, aborted handshakes) are retried with
    /// exponential backoff from 5 ms up to 1 s. Live sessions are not torn
    /// down when the loop ends.
    ///
    /// # Arguments
    ///
    /// * `listener` - Source of client connections, usually a `TcpListener`
    /// * `shutdown` - Ends the loop when a value is broadcast
    ///
    /// # Errors
    ///
    /// * `ListenerClosed` - nobody connected within the idle window
    /// * `Io` - the listener failed with a non-temporary error
    ///
    /// # Example
    ///
    /// ```ignore
    /// let proxy = Proxy::new(Arc::new(TcpDialer::new("db", 5432)), ProxyOptions::default());
    /// let listener = TcpListener::bind("127.0.0.1:6432").await?;
    /// let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    /// proxy.serve(listener, shutdown_rx).await?;
    /// ```
    pub async fn serve<L>(&self, mut listener: L, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        L: ConnectionSource,
    {
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);
        let mut idle_armed = true;

        // Accepting pauses while the retry timer runs; shutdown and idle stay live
        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut backing_off = false;
        let mut backoff: Option<Duration> = None;

        let result = loop {
            tokio::select! {
                result = listener.accept(), if !backing_off => {
                    match result {
                        Ok((stream, addr)) => {
                            idle_armed = false;
                            backoff = None;
                            debug!("Accepted connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) if is_temporary(&e) => {
                            let delay = next_backoff(backoff);
                            backoff = Some(delay);
                            warn!("Accept error: {}; retrying in {:?}", e, delay);
                            retry.as_mut().reset(Instant::now() + delay);
                            backing_off = true;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break Err(e.into());
                        }
                    }
                }

                _ = &mut retry, if backing_off => {
                    backing_off = false;
                }

                _ = &mut idle, if idle_armed => {
                    warn!("No connection within {:?}, closing listener", self.idle_timeout);
                    break Err(ProxyError::ListenerClosed(format!(
                        "no connection within {:?}",
                        self.idle_timeout
                    )));
                }

                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break Ok(());
                }
            }
        };

        info!(
            "Listener stopped. Total: {}, Active: {}, Cancels routed: {}, unmatched: {}",
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.connections_active.load(Ordering::Relaxed),
            self.stats.cancels_routed.load(Ordering::Relaxed),
            self.stats.cancels_unmatched.load(Ordering::Relaxed)
        );

        result
    }

    fn spawn_connection<S>(&self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let proxy = self.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.handle_connection(stream).await {
                warn!("Connection from {} error: {}", addr, e);
            }
            proxy.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            debug!("Connection from {} closed", addr);
        });
    }

    /// Negotiate with the client, then either run a session or route a cancel.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ClientHandshake { stream, hello } =
            timeout(self.handshake_timeout, self.client.negotiate(stream))
                .await
                .map_err(|_| ProxyError::Timeout("waiting for client startup".into()))??;

        match hello {
            Hello::Startup(startup) => self.run_session(stream, startup).await,
            Hello::Cancel(cancel) => {
                self.route_cancel(cancel).await;
                Ok(())
            }
        }
    }

    async fn run_session<S>(&self, mut client: NetworkStream<S>, startup: StartupData) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!(
            "Client connecting as '{}' to database '{}'",
            startup.username, startup.database
        );

        let dialed = match timeout(self.handshake_timeout, self.dialer.dial(&startup)).await {
            Ok(dialed) => dialed,
            Err(_) => Err(ProxyError::Timeout("dialing backend".into())),
        };
        let backend = match dialed {
            Ok(backend) => backend,
            Err(e) => {
                report_fatal(&mut client, &e).await;
                return Err(e);
            }
        };
        let canceller = backend.canceller();

        let negotiated = timeout(
            self.handshake_timeout,
            self.server.negotiate(backend, &startup, &mut client),
        )
        .await;
        let ServerHandshake {
            stream: backend,
            key_data,
        } = match negotiated {
            Ok(handshake) => handshake?,
            Err(_) => {
                let e = ProxyError::Timeout("backend handshake".into());
                report_fatal(&mut client, &e).await;
                return Err(e);
            }
        };

        if let Some(key) = key_data {
            if !self.registry.insert(key, Arc::clone(&canceller)) {
                warn!("Backend reused key data for pid {}", key.process_id);
            }
        } else {
            debug!("Backend sent no BackendKeyData; session cannot be cancelled");
        }

        let result = Session::new(client, backend)
            .with_drain_timeout(self.drain_timeout)
            .relay()
            .await;

        if let Some(key) = key_data {
            self.registry.remove(&key, &canceller);
        }
        debug!(
            "Session for '{}' on '{}' ended",
            startup.username, startup.database
        );
        result
    }

    async fn route_cancel(&self, cancel: CancelData) {
        match self.registry.lookup(&BackendKeyData::from(cancel)) {
            Some(canceller) => {
                self.stats.cancels_routed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = canceller.cancel(&cancel).await {
                    warn!("Failed to forward CancelRequest for pid {}: {}", cancel.process_id, e);
                }
            }
            None => {
                self.stats.cancels_unmatched.fetch_add(1, Ordering::Relaxed);
                debug!("No session for CancelRequest pid {}", cancel.process_id);
            }
        }
    }
}

/// Best-effort FATAL ErrorResponse; the connection is closing anyway.
async fn report_fatal<W>(client: &mut W, err: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    if let Err(write_err) = write_error_response(client, err).await {
        debug!("Failed to send error to client: {}", write_err);
    }
}

/// Accept errors worth retrying: aborted handshakes and descriptor exhaustion.
fn is_temporary(err: &io::Error) -> bool {
    // ENFILE, EMFILE
    if matches!(err.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => ACCEPT_BACKOFF_INITIAL,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::backend::{CancelBackend, LogicalConnection};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, DuplexStream};

    struct NeverDial;

    #[async_trait]
    impl DialBackend for NeverDial {
        async fn dial(&self, startup: &StartupData) -> Result<LogicalConnection> {
            Err(ProxyError::DatabaseNotFound(startup.database.clone()))
        }
    }

    /// Replays accept results, then waits forever.
    struct ScriptedSource {
        results: VecDeque<io::Result<(DuplexStream, SocketAddr)>>,
        accepted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionSource for ScriptedSource {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
            match self.results.pop_front() {
                Some(result) => {
                    self.accepted.fetch_add(1, Ordering::SeqCst);
                    result
                }
                None => std::future::pending().await,
            }
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5432".parse().unwrap()
    }

    fn proxy(idle_timeout: Duration) -> Proxy {
        Proxy::new(
            Arc::new(NeverDial),
            ProxyOptions {
                idle_timeout,
                ..ProxyOptions::default()
            },
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = next_backoff(None);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_backoff(Some(delay));
        assert_eq!(delay, Duration::from_millis(10));
        for _ in 0..20 {
            delay = next_backoff(Some(delay));
        }
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn test_is_temporary() {
        assert!(is_temporary(&io::Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&io::Error::from(ErrorKind::PermissionDenied)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_listener_closes() {
        let (_tx, rx) = broadcast::channel(1);
        let source = ScriptedSource {
            results: VecDeque::new(),
            accepted: Arc::new(AtomicUsize::new(0)),
        };

        let err = proxy(Duration::from_secs(600))
            .serve(source, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ListenerClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_errors_are_retried() {
        let (tx, rx) = broadcast::channel(1);
        let (_client, server) = duplex(64);
        let accepted = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            results: VecDeque::from(vec![
                Err(io::Error::from(ErrorKind::ConnectionAborted)),
                Err(io::Error::from_raw_os_error(24)),
                Ok((server, addr())),
            ]),
            accepted: Arc::clone(&accepted),
        };

        let proxy = proxy(Duration::from_millis(100));
        let stats = proxy.stats();
        let serve = tokio::spawn(async move { proxy.serve(source, rx).await });

        // Past the idle window: the accepted connection disarmed it.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);

        tx.send(()).unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_observed_during_backoff() {
        let (tx, rx) = broadcast::channel(1);
        let errors = (0..12)
            .map(|_| Err(io::Error::from(ErrorKind::ConnectionAborted)))
            .collect();
        let source = ScriptedSource {
            results: errors,
            accepted: Arc::new(AtomicUsize::new(0)),
        };

        let proxy = proxy(Duration::from_secs(600));
        let serve = tokio::spawn(async move { proxy.serve(source, rx).await });

        // Retries back off 5, 10, ... 640 ms, then sit in a 1 s wait
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let sent = Instant::now();
        tx.send(()).unwrap();
        serve.await.unwrap().unwrap();
        assert!(sent.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_fatal_accept_error_stops_loop() {
        let (_tx, rx) = broadcast::channel(1);
        let source = ScriptedSource {
            results: VecDeque::from(vec![Err(io::Error::from(ErrorKind::PermissionDenied))]),
            accepted: Arc::new(AtomicUsize::new(0)),
        };

        let err = proxy(Duration::from_secs(600))
            .serve(source, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[tokio::test]
    async fn test_unmatched_cancel_is_counted() {
        let proxy = proxy(Duration::from_secs(600));
        proxy.route_cancel(CancelData::new(7, 8)).await;
        assert_eq!(proxy.stats.cancels_unmatched.load(Ordering::Relaxed), 1);
        assert_eq!(proxy.stats.cancels_routed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_matched_cancel_reaches_backend() {
        #[derive(Default)]
        struct Recorder(std::sync::Mutex<Vec<CancelData>>);

        #[async_trait]
        impl CancelBackend for Recorder {
            async fn cancel(&self, cancel: &CancelData) -> Result<()> {
                self.0.lock().unwrap().push(*cancel);
                Ok(())
            }
        }

        let proxy = proxy(Duration::from_secs(600));
        let recorder = Arc::new(Recorder::default());
        proxy
            .registry()
            .insert(BackendKeyData::new(42, 99), recorder.clone());

        proxy.route_cancel(CancelData::new(42, 99)).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![CancelData::new(42, 99)]);
        assert_eq!(proxy.stats.cancels_routed.load(Ordering::Relaxed), 1);
    }
}
