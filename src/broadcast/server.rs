//! WebSocket endpoint for live subscribers.
//!
//! # Responsibilities
//! - Accept WebSocket upgrades on any path
//! - Register each socket with the [`Broadcaster`] and forward envelopes as
//!   text frames
//! - Unregister on close, error or endpoint shutdown
//!
//! Subscribers are registered as connecting while the handshake is in flight
//! and only become open once the upgrade completes.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::channel::{Broadcaster, Message, SubscriberId, SubscriberState};
use crate::lifecycle::Shutdown;
use crate::net::ListenerError;

#[derive(Clone)]
struct EndpointState {
    broadcaster: Arc<Broadcaster>,
    shutdown: Shutdown,
}

/// A running subscriber endpoint.
#[derive(Debug)]
pub struct SubscriberServer {
    port: u16,
    broadcaster: Arc<Broadcaster>,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl SubscriberServer {
    /// Bind `host:port` and start accepting subscribers. Port 0 picks an
    /// ephemeral port; [`port`](Self::port) reports the bound one.
    pub async fn start(host: &str, port: u16, broadcaster: Arc<Broadcaster>) -> Result<Self, ListenerError> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind { addr: addr.clone(), source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?
            .port();

        let shutdown = Shutdown::new();
        let state = EndpointState {
            broadcaster: Arc::clone(&broadcaster),
            shutdown: shutdown.clone(),
        };
        let app = Router::new().fallback(subscribe_handler).with_state(state);

        let mut stop = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Subscriber endpoint failed");
            }
        });

        broadcaster.set_endpoint_port(Some(port));
        tracing::info!(port, "Subscriber endpoint started");

        Ok(Self {
            port,
            broadcaster,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the endpoint and every subscriber socket it accepted.
    pub async fn stop(self) {
        self.broadcaster.set_endpoint_port(None);
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Subscriber endpoint task ended abnormally");
        }
        tracing::info!(port = self.port, "Subscriber endpoint stopped");
    }
}

async fn subscribe_handler(State(state): State<EndpointState>, upgrade: WebSocketUpgrade) -> Response {
    let id = Uuid::new_v4();
    let (tx, rx) = state.broadcaster.channel();
    state.broadcaster.subscribe_pending(id, tx);

    let broadcaster = Arc::clone(&state.broadcaster);
    let abandoned = Arc::clone(&state.broadcaster);
    let stop = state.shutdown.subscribe();
    upgrade
        .on_failed_upgrade(move |e| {
            abandoned.unsubscribe(id);
            tracing::debug!(subscriber = %id, error = %e, "Subscriber upgrade failed");
        })
        .on_upgrade(move |socket| run_subscriber(socket, id, rx, broadcaster, stop))
}

async fn run_subscriber(
    socket: WebSocket,
    id: SubscriberId,
    mut rx: mpsc::Receiver<Message>,
    broadcaster: Arc<Broadcaster>,
    mut stop: broadcast::Receiver<()>,
) {
    broadcaster.set_state(id, SubscriberState::Open);
    tracing::info!(subscriber = %id, "Subscriber connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(WsMessage::Text(message.as_ref().into())).await {
                    tracing::debug!(subscriber = %id, error = %e, "Subscriber send failed");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber = %id, error = %e, "Subscriber socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = stop.recv() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    broadcaster.set_state(id, SubscriberState::Closing);
    broadcaster.unsubscribe(id);
    tracing::info!(subscriber = %id, "Subscriber disconnected");
}
