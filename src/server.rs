use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use http::StatusCode;
use n0_error::{AnyError, Result, anyerr, e, stack_error};
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    intercept::{Interceptor, Interceptors},
    parse::{HttpMessage, Side, parse_head},
    route::{ConfigError, Endpoint, ResolveRoute, RouteEntry, RouteTable},
    track::ConnectionTracker,
    transduce::{SharedProtocol, Transducer, relay},
    util::{ReadAhead, write_error_response},
};

/// How long a backend dial may take before the connection is answered 503.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a proxied connection could not run (or stopped running).
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The proxy is passive; new connections are answered 503.
    #[error("proxy is passive")]
    Inactive,
    /// The first request never parsed.
    #[error("malformed first request")]
    BadRequest {
        #[error(source)]
        source: AnyError,
    },
    /// No route matched the virtual host.
    #[error("no route for virtual host {host:?}")]
    NoRoute { host: String },
    /// The resolved backend could not be dialed.
    #[error("failed to dial backend {endpoint} for {host:?}")]
    DialFailed {
        host: String,
        endpoint: Endpoint,
        #[error(source)]
        source: AnyError,
    },
    /// The relay failed mid-stream.
    #[error("relay failed")]
    Io {
        #[error(source)]
        source: AnyError,
    },
}

impl ConnectionError {
    /// The status the proxy answers the client with, if any. Mid-stream
    /// failures get silence, not a body.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            Self::Inactive { .. } => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::BadRequest { .. } => Some(StatusCode::BAD_REQUEST),
            Self::NoRoute { .. } => Some(StatusCode::NOT_FOUND),
            Self::DialFailed { .. } => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::Io { .. } => None,
        }
    }
}

/// Whether the proxy is servicing new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Status {
    #[display("active")]
    Active,
    #[display("passive")]
    Passive,
}

/// Owns the fate of a client socket the proxy gave up on.
///
/// Consulted on backend dial failure (status 503): when a callback is
/// registered for the status it receives the connected client socket and the
/// resolved virtual host, and the proxy writes nothing further.
pub trait StatusCallback: Send + Sync {
    fn invoke(&self, client: TcpStream, host: &str);
}

impl<F> StatusCallback for F
where
    F: Fn(TcpStream, &str) + Send + Sync,
{
    fn invoke(&self, client: TcpStream, host: &str) {
        self(client, host)
    }
}

/// Status-code-to-callback mapping installed via [`ProxyServer::set_callbacks`].
pub type Callbacks = HashMap<u16, Arc<dyn StatusCallback>>;

#[derive(derive_more::Debug)]
struct Shared {
    active: AtomicBool,
    config: RwLock<Arc<Vec<RouteEntry>>>,
    routes: RwLock<Arc<RouteTable>>,
    resolver: RwLock<ResolveRoute>,
    #[debug("RwLock<Callbacks>")]
    callbacks: RwLock<Arc<Callbacks>>,
    interceptors: Arc<Interceptors>,
    tracker: ConnectionTracker,
    shutdown: CancellationToken,
}

impl Shared {
    fn routes(&self) -> Arc<RouteTable> {
        self.routes.read().expect("poisoned").clone()
    }

    fn resolver(&self) -> ResolveRoute {
        self.resolver.read().expect("poisoned").clone()
    }

    fn callback_for(&self, status: StatusCode) -> Option<Arc<dyn StatusCallback>> {
        self.callbacks
            .read()
            .expect("poisoned")
            .get(&status.as_u16())
            .cloned()
    }
}

/// Host-based reverse proxy.
///
/// Accepts TCP connections on a caller-provided listener, routes each by the
/// first request's virtual host, and relays bytes with inline interception.
/// All control operations act on shared state observed by connection tasks as
/// consistent snapshots, so they are safe to call while traffic flows.
///
/// A new server is passive: connections are answered `503` until
/// [`ProxyServer::start`] is called.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Creates a server from route configuration.
    pub fn new(entries: Vec<RouteEntry>) -> Result<Self, ConfigError> {
        let routes = RouteTable::build(&entries)?;
        Ok(Self {
            shared: Arc::new(Shared {
                active: AtomicBool::new(false),
                config: RwLock::new(Arc::new(entries)),
                routes: RwLock::new(Arc::new(routes)),
                resolver: RwLock::new(ResolveRoute::default()),
                callbacks: RwLock::new(Arc::new(Callbacks::new())),
                interceptors: Arc::new(Interceptors::new()),
                tracker: ConnectionTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Begins servicing new connections.
    pub fn start(&self) {
        self.shared.active.store(true, Ordering::SeqCst);
        debug!("proxy started");
    }

    /// Stops servicing new connections. Established flows keep running.
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        debug!("proxy stopped");
    }

    pub fn status(&self) -> Status {
        if self.shared.active.load(Ordering::SeqCst) {
            Status::Active
        } else {
            Status::Passive
        }
    }

    /// The route configuration currently in force.
    pub fn config(&self) -> Arc<Vec<RouteEntry>> {
        self.shared.config.read().expect("poisoned").clone()
    }

    /// Replaces the route configuration wholesale. In-flight connections
    /// keep the table they resolved against.
    pub fn set_config(&self, entries: Vec<RouteEntry>) -> Result<(), ConfigError> {
        let routes = Arc::new(RouteTable::build(&entries)?);
        *self.shared.routes.write().expect("poisoned") = routes;
        *self.shared.config.write().expect("poisoned") = Arc::new(entries);
        debug!("route configuration replaced");
        Ok(())
    }

    /// The current (virtual host -> endpoint) snapshot.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.shared.routes()
    }

    pub fn callbacks(&self) -> Arc<Callbacks> {
        self.shared.callbacks.read().expect("poisoned").clone()
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.shared.callbacks.write().expect("poisoned") = Arc::new(callbacks);
    }

    /// Appends a transform to the request pipeline; it applies to every
    /// request framed from now on.
    pub fn add_request_interceptor(&self, interceptor: impl Interceptor + 'static) {
        self.shared.interceptors.add_request(Arc::new(interceptor));
    }

    /// Appends a transform to the response pipeline.
    pub fn add_response_interceptor(&self, interceptor: impl Interceptor + 'static) {
        self.shared.interceptors.add_response(Arc::new(interceptor));
    }

    /// Replaces how first requests are turned into endpoints.
    pub fn set_route_resolver(&self, resolver: impl Into<ResolveRoute>) {
        *self.shared.resolver.write().expect("poisoned") = resolver.into();
    }

    /// Closes every client connection charged to `host`; returns how many.
    pub fn disconnect_clients(&self, host: &str) -> usize {
        self.shared.tracker.close_host(host)
    }

    /// Closes every client connection; returns how many.
    pub fn disconnect_all_clients(&self) -> usize {
        self.shared.tracker.close_all()
    }

    /// The live connection registry.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.shared.tracker
    }

    /// Stops the accept loop and closes every connection it spawned.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Accepts connections from `listener` and proxies each in its own task
    /// until [`ProxyServer::shutdown`] or a listener error.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let shutdown = self.shared.shutdown.clone();
        let mut id = 0u64;
        loop {
            let (stream, client_addr) = tokio::select! {
                res = listener.accept() => res?,
                _ = shutdown.cancelled() => {
                    debug!("accept loop stopped");
                    return Ok(());
                }
            };
            let shared = self.shared.clone();
            let closer = shutdown.child_token();
            let fut = {
                let closer = closer.clone();
                async move {
                    debug!(%client_addr, "accepted connection");
                    if let Err(err) = handle_connection(shared, stream, closer).await {
                        warn!("connection closed with error: {err:#}");
                    }
                }
            };
            tokio::spawn(
                closer
                    .run_until_cancelled_owned(fut)
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }
}

/// Runs one connection and, on failure, answers the client: either through
/// the user callback that owns the socket from then on, or with the minimal
/// error response for the failure's status.
async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    closer: CancellationToken,
) -> Result<(), ConnectionError> {
    match proxy_connection(&shared, &mut stream, closer).await {
        Ok(()) => {
            debug!("connection closed");
            Ok(())
        }
        Err(err) => {
            if let ConnectionError::DialFailed { host, .. } = &err
                && let Some(callback) = shared.callback_for(StatusCode::SERVICE_UNAVAILABLE)
            {
                debug!(%host, "backend dial failed, handing client socket to user callback");
                callback.invoke(stream, host);
                return Ok(());
            }
            if let Some(status) = err.response_status() {
                debug!(%status, "answering with error response");
                write_error_response(&mut stream, status).await.ok();
            }
            Err(err)
        }
    }
}

/// The connection lifecycle: peek the first request, resolve, dial, track,
/// relay until either side is done.
async fn proxy_connection(
    shared: &Shared,
    stream: &mut TcpStream,
    closer: CancellationToken,
) -> Result<(), ConnectionError> {
    if !shared.active.load(Ordering::SeqCst) {
        return Err(e!(ConnectionError::Inactive));
    }

    let (client_recv, mut client_send) = stream.split();
    let mut client_recv = ReadAhead::new(client_recv, HEADER_SECTION_MAX_LENGTH);
    // The head is peeked, not consumed: every buffered byte replays through
    // the request transducer below, so body data pipelined into the first
    // packet survives.
    let request = peek_first_request(&mut client_recv).await?;
    let host = request.host().unwrap_or_default().to_string();

    let table = shared.routes();
    let resolver = shared.resolver();
    let endpoint = resolver
        .resolve(&request, &table)
        .ok_or_else(|| e!(ConnectionError::NoRoute { host: host.clone() }))?;
    debug!(%host, %endpoint, "resolved route");

    let backend = match timeout(CONNECT_TIMEOUT, endpoint.dial()).await {
        Ok(Ok(backend)) => backend,
        Ok(Err(err)) => {
            return Err(e!(ConnectionError::DialFailed {
                host,
                endpoint,
                source: err.into()
            }));
        }
        Err(_) => {
            return Err(e!(ConnectionError::DialFailed {
                host,
                endpoint,
                source: anyerr!("backend dial timed out after {CONNECT_TIMEOUT:?}")
            }));
        }
    };
    debug!("connected to backend");

    let id = shared.tracker.add(&host, closer);
    let _tracked = TrackerGuard {
        tracker: &shared.tracker,
        id,
    };

    let (mut backend_recv, mut backend_send) = tokio::io::split(backend);
    let protocol = SharedProtocol::new();
    let mut request_side = Transducer::new(
        Side::Request,
        shared.interceptors.clone(),
        protocol.clone(),
    );
    let mut response_side =
        Transducer::new(Side::Response, shared.interceptors.clone(), protocol);

    let (up, down) = relay(
        &mut client_recv,
        &mut client_send,
        &mut backend_recv,
        &mut backend_send,
        &mut request_side,
        &mut response_side,
    )
    .await
    .map_err(|err| e!(ConnectionError::Io { source: err.into() }))?;
    debug!(up, down, "relay finished");
    Ok(())
}

/// Reads until the first request head parses, without consuming it.
async fn peek_first_request<R: AsyncRead + Unpin>(
    reader: &mut ReadAhead<R>,
) -> Result<HttpMessage, ConnectionError> {
    loop {
        if let Some((_, request)) = parse_head(Side::Request, reader.peeked())
            .map_err(|err| e!(ConnectionError::BadRequest { source: anyerr!(err) }))?
        {
            return Ok(request);
        }
        if reader.is_full() {
            return Err(e!(ConnectionError::BadRequest {
                source: anyerr!("first request head exceeds {HEADER_SECTION_MAX_LENGTH} bytes")
            }));
        }
        let n = reader
            .fill()
            .await
            .map_err(|err| e!(ConnectionError::BadRequest { source: err.into() }))?;
        if n == 0 {
            return Err(e!(ConnectionError::BadRequest {
                source: anyerr!("client closed before the first request head completed")
            }));
        }
    }
}

/// Removes a connection from the tracker exactly once, on every exit path
/// including forced cancellation.
struct TrackerGuard<'a> {
    tracker: &'a ConnectionTracker,
    id: u64,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}
