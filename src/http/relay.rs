//! The HTTP relay: one proxied exchange end-to-end.
//!
//! # Data Flow
//! ```text
//! client request
//!     → health path?            → HealthReport (backend never contacted)
//!     → CONNECT (reused conn)?  → hyper upgrade → tunnel::splice
//!     → Receiving:        buffer body, capture, observer, publish `request`
//!     → Forwarding:       localhost:<target>, Host stripped, deadline on the head
//!     → RelayingResponse: head to client now, body streamed + buffered by a pump task
//!     → on end:           decode, capture, observer, publish `response`, end client body
//! ```

use std::io;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, request, Method, Request},
    response::{IntoResponse, Response},
    Extension,
};
use bytes::Bytes;
use futures_util::stream;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::broadcast::CaptureEvent;
use crate::capture::record::{RequestRecorder, ResponseRecorder};
use crate::http::exchange::{Exchange, ExchangeEvent};
use crate::http::health::HealthReport;
use crate::http::response;
use crate::http::server::{AppState, RelayContext};
use crate::http::BACKEND_HOST;
use crate::net::connection::ConnectionId;
use crate::net::tunnel;

/// Chunks in flight between the pump task and the client connection.
const RELAY_BUFFER: usize = 16;

enum ReceiveError {
    TooLarge,
    Stream(axum::Error),
}

/// Fallback handler for every request on a relay instance.
pub async fn relay_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(connection): Extension<ConnectionId>,
    request: Request<Body>,
) -> Response {
    let ctx = &state.context;

    if request.uri().path() == ctx.config.relay.health_path {
        tracing::debug!(connection_id = %connection, "Health check answered locally");
        return HealthReport::new(state.target_port, ctx.broadcaster.endpoint_port(), ctx.clock.wall())
            .into_response();
    }

    if request.method() == Method::CONNECT {
        return tunnel_upgrade(state.target_port, request).await;
    }

    let received_at = ctx.clock.now();
    let mut exchange = Exchange::new(connection);
    let (parts, body) = request.into_parts();
    let mut recorder = RequestRecorder::new(&parts, Some(peer));
    let url = recorder_url(&parts);

    // Receiving
    let limit = ctx.config.relay.max_request_body_bytes;
    match receive_body(body, &mut recorder, limit).await {
        Ok(()) => {}
        Err(ReceiveError::TooLarge) => {
            tracing::warn!(connection_id = %connection, url = %url, limit, "Request body too large");
            return response::payload_too_large(&url, limit);
        }
        Err(ReceiveError::Stream(e)) => {
            tracing::warn!(connection_id = %connection, url = %url, error = %e, "Client stream failed");
            return response::bad_request(&url, e.to_string());
        }
    }

    let (captured, raw_body) = recorder.finish(ctx.clock.as_ref());
    ctx.observers.notify_request(&captured);
    ctx.broadcaster.publish(CaptureEvent::Request(captured.clone()));
    exchange.advance(ExchangeEvent::RequestCaptured);

    tracing::debug!(
        connection_id = %connection,
        method = %parts.method,
        url = %url,
        target_port = state.target_port,
        "Forwarding request"
    );

    // Forwarding
    let outbound = match build_outbound(&parts, state.target_port, raw_body) {
        Ok(outbound) => outbound,
        Err(e) => {
            exchange.advance(ExchangeEvent::ForwardFailed);
            return finish_with_error(&mut exchange, response::proxy_error(state.target_port, &url, &e));
        }
    };

    let deadline = ctx.config.relay.response_timeout();
    let backend_response = match tokio::time::timeout(deadline, state.client.request(outbound)).await {
        Ok(Ok(backend_response)) => {
            exchange.advance(ExchangeEvent::ResponseHead);
            backend_response
        }
        Ok(Err(e)) => {
            exchange.advance(ExchangeEvent::ForwardFailed);
            tracing::warn!(
                connection_id = %connection,
                url = %url,
                target_port = state.target_port,
                error = %e,
                "Backend request failed"
            );
            return finish_with_error(&mut exchange, response::proxy_error(state.target_port, &url, &e));
        }
        Err(_) => {
            exchange.advance(ExchangeEvent::DeadlineElapsed);
            tracing::warn!(
                connection_id = %connection,
                url = %url,
                target_port = state.target_port,
                timeout_secs = deadline.as_secs(),
                "Backend response timed out"
            );
            return finish_with_error(
                &mut exchange,
                response::gateway_timeout(state.target_port, &url, deadline.as_secs()),
            );
        }
    };

    // RelayingResponse
    let head_claimed = exchange.begin_response();
    debug_assert!(head_claimed, "response head claimed twice");

    let (parts, body) = backend_response.into_parts();
    let recorder = ResponseRecorder::new(captured, received_at, &parts);
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_BUFFER);
    tokio::spawn(pump_response(body, tx, recorder, ctx.clone(), exchange));

    let client_body = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
    Response::from_parts(parts, Body::from_stream(client_body))
}

fn recorder_url(parts: &request::Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned())
}

async fn receive_body(mut body: Body, recorder: &mut RequestRecorder, limit: usize) -> Result<(), ReceiveError> {
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReceiveError::Stream)?;
        if let Ok(data) = frame.into_data() {
            if recorder.len() + data.len() > limit {
                return Err(ReceiveError::TooLarge);
            }
            recorder.push(&data);
        }
    }
    Ok(())
}

/// Mirror the inbound request onto the backend, minus `Host`.
fn build_outbound(
    parts: &request::Parts,
    target_port: u16,
    body: Bytes,
) -> Result<Request<Body>, axum::http::Error> {
    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!("http://{}:{}{}", BACKEND_HOST, target_port, path));

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    builder.body(Body::from(body))
}

fn finish_with_error(exchange: &mut Exchange, error_response: Response) -> Response {
    let head_claimed = exchange.begin_response();
    debug_assert!(head_claimed, "error response after head was sent");
    exchange.advance(ExchangeEvent::Finished);
    tracing::debug!(state = %exchange.state(), "Exchange answered with an error");
    error_response
}

/// Stream the backend body to the client while buffering it for capture.
async fn pump_response(
    mut body: Incoming,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    mut recorder: ResponseRecorder,
    ctx: RelayContext,
    mut exchange: Exchange,
) {
    let mut client_gone = false;

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                recorder.push(&data);
                if !client_gone && tx.send(Ok(data)).await.is_err() {
                    client_gone = true;
                    tracing::debug!("Client went away, draining backend for capture");
                }
            }
            Err(e) => {
                exchange.advance(ExchangeEvent::BackendFailed);
                tracing::warn!(
                    error = %e,
                    state = %exchange.state(),
                    buffered = recorder.len(),
                    "Backend stream failed mid-response"
                );
                exchange.advance(ExchangeEvent::Finished);
                return;
            }
        }
    }

    let captured = recorder.finish(ctx.clock.as_ref());
    tracing::info!(
        method = %captured.request().method(),
        url = %captured.request().url(),
        status = captured.status_code(),
        duration_ms = captured.duration_ms(),
        "Exchange completed"
    );

    ctx.observers.notify_response(&captured);
    ctx.broadcaster.publish(CaptureEvent::Response(captured));
    exchange.advance(ExchangeEvent::BackendEnded);
    drop(tx);
}

/// CONNECT arriving on an already-parsed HTTP connection.
async fn tunnel_upgrade(target_port: u16, request: Request<Body>) -> Response {
    let url = request.uri().to_string();
    let mut backend = match TcpStream::connect((BACKEND_HOST, target_port)).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(target_port, error = %e, "CONNECT backend unreachable");
            return response::proxy_error(target_port, &url, &e);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tunnel::splice(&mut client, &mut backend).await {
                    Ok(stats) => tracing::debug!(
                        target_port,
                        client_to_backend = stats.client_to_backend,
                        backend_to_client = stats.backend_to_client,
                        "Tunnel closed"
                    ),
                    Err(e) => tracing::debug!(target_port, error = %e, "Tunnel failed"),
                }
            }
            Err(e) => tracing::debug!(target_port, error = %e, "CONNECT upgrade failed"),
        }
    });

    let mut established = Response::new(Body::empty());
    established
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    established
}
