//! Per-instance relay server.
//!
//! # Responsibilities
//! - Own the accept loop of one instance's listening port
//! - Route each connection to the CONNECT tunnel or to hyper
//! - Build the Axum router that runs [`relay_handler`]
//! - Drain connections gracefully when the instance stops
//!
//! CONNECT is detected on the raw socket so the tunnel reply is written
//! verbatim. Every other connection is served by hyper's HTTP/1 server with
//! upgrades enabled, which still lets a CONNECT arriving on a kept-alive
//! connection reach the relay handler.
//!
//! Stopping an instance only closes its listener. Open tunnels run until
//! either peer closes, and HTTP connections finish their in-flight exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, extract::ConnectInfo, http::Request, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::broadcast::Broadcaster;
use crate::capture::{Clock, Observers, SystemClock};
use crate::config::ProxyConfig;
use crate::http::relay::relay_handler;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionKind, ConnectionTracker};
use crate::net::listener::ConnectionPermit;
use crate::net::sniff::{sniff, PrefixedIo, Sniffed};
use crate::net::{tunnel, Listener};

/// Pause after a failed accept so descriptor exhaustion doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Collaborators shared by every instance in the process.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub config: Arc<ProxyConfig>,
    pub broadcaster: Arc<Broadcaster>,
    pub observers: Arc<Observers>,
    pub clock: Arc<dyn Clock>,
}

impl RelayContext {
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ProxyConfig, clock: Arc<dyn Clock>) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.subscribers.buffer_size, Arc::clone(&clock)));
        Self {
            config: Arc::new(config),
            broadcaster,
            observers: Arc::new(Observers::new()),
            clock,
        }
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub context: RelayContext,
    pub target_port: u16,
    pub client: Client<HttpConnector, Body>,
}

/// HTTP relay for a single instance.
pub struct RelayServer {
    router: Router,
    target_port: u16,
    max_head_bytes: usize,
    tracker: ConnectionTracker,
}

impl RelayServer {
    /// Create a relay forwarding to `localhost:<target_port>`.
    pub fn new(context: RelayContext, target_port: u16) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let max_head_bytes = context.config.tunnel.max_head_bytes;

        let state = AppState {
            context,
            target_port,
            client,
        };

        Self {
            router: Self::build_router(state),
            target_port,
            max_head_bytes,
            tracker: ConnectionTracker::new(),
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(relay_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Live connection counter for this instance.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        let addr = listener.local_addr().ok();
        tracing::info!(
            address = ?addr,
            target_port = self.target_port,
            "Relay server starting"
        );

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let connection = Connection {
                            stream,
                            peer,
                            guard: self.tracker.track(),
                            _permit: permit,
                        };
                        tokio::spawn(serve_connection(
                            connection,
                            self.router.clone(),
                            self.target_port,
                            self.max_head_bytes,
                            shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!(
            address = ?addr,
            active_connections = self.tracker.active_count(),
            "Relay server stopped accepting"
        );
    }
}

/// An accepted socket plus the slots it holds until it closes.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
}

async fn serve_connection(
    mut connection: Connection,
    router: Router,
    target_port: u16,
    max_head_bytes: usize,
    mut stop: broadcast::Receiver<()>,
) {
    let connection_id = connection.guard.id();
    let peer = connection.peer;

    let sniffed = tokio::select! {
        _ = stop.recv() => return,
        sniffed = sniff(&mut connection.stream) => sniffed,
    };

    match sniffed {
        Ok(Sniffed::Closed) => {}
        Ok(Sniffed::Connect(buffered)) => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = ?ConnectionKind::Tunnel,
                peer = %peer,
                "Connection classified"
            );
            match tunnel::bridge(connection.stream, buffered, target_port, max_head_bytes).await {
                Ok(stats) => tracing::debug!(
                    connection_id = %connection_id,
                    client_to_backend = stats.client_to_backend,
                    backend_to_client = stats.backend_to_client,
                    "Tunnel closed"
                ),
                Err(e) => tracing::debug!(connection_id = %connection_id, error = %e, "Tunnel failed"),
            }
        }
        Ok(Sniffed::Http(prefix)) => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = ?ConnectionKind::Http,
                peer = %peer,
                "Connection classified"
            );
            let io = TokioIo::new(PrefixedIo::new(prefix, connection.stream));
            let service = service_fn(move |request: Request<Incoming>| {
                let mut request = request.map(Body::new);
                request.extensions_mut().insert(ConnectInfo(peer));
                request.extensions_mut().insert(connection_id);
                router.clone().oneshot(request)
            });

            let conn = http1::Builder::new().serve_connection(io, service).with_upgrades();
            tokio::pin!(conn);

            let served = tokio::select! {
                served = conn.as_mut() => served,
                _ = stop.recv() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = served {
                tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
            }
        }
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "Failed to read request line");
        }
    }

    drop(connection.guard);
}
