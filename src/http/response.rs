//! Proxy-originated responses.
//!
//! # Responsibilities
//! - Build the JSON error bodies for 502 / 504 (and 400 / 413 on the inbound side)
//! - Map transport errors to errno-style codes
//!
//! Backend responses are never rewritten here; they are relayed as-is.

use std::error::Error as StdError;
use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::http::BACKEND_HOST;

/// 502 body.
#[derive(Debug, Serialize)]
pub struct ProxyErrorBody {
    pub error: &'static str,
    pub message: String,
    pub code: &'static str,
    pub target: String,
    pub url: String,
}

/// 504 body.
#[derive(Debug, Serialize)]
pub struct GatewayTimeoutBody {
    pub error: &'static str,
    pub message: String,
    pub target: String,
    pub url: String,
}

/// 400 / 413 body for problems with the inbound request.
#[derive(Debug, Serialize)]
pub struct ClientErrorBody {
    pub error: &'static str,
    pub message: String,
    pub url: String,
}

pub fn target_label(target_port: u16) -> String {
    format!("{}:{}", BACKEND_HOST, target_port)
}

/// The backend could not be reached or dropped the connection.
pub fn proxy_error(target_port: u16, url: &str, err: &(dyn StdError + 'static)) -> Response {
    let body = ProxyErrorBody {
        error: "Proxy Error",
        message: describe(err),
        code: error_code(err),
        target: target_label(target_port),
        url: url.to_owned(),
    };
    (StatusCode::BAD_GATEWAY, Json(body)).into_response()
}

/// The backend did not answer within the deadline.
pub fn gateway_timeout(target_port: u16, url: &str, after_secs: u64) -> Response {
    let body = GatewayTimeoutBody {
        error: "Gateway Timeout",
        message: format!("Backend did not respond within {} seconds", after_secs),
        target: target_label(target_port),
        url: url.to_owned(),
    };
    (StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response()
}

pub fn payload_too_large(url: &str, limit: usize) -> Response {
    let body = ClientErrorBody {
        error: "Payload Too Large",
        message: format!("Request body exceeds {} bytes", limit),
        url: url.to_owned(),
    };
    (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response()
}

pub fn bad_request(url: &str, message: String) -> Response {
    let body = ClientErrorBody {
        error: "Bad Request",
        message,
        url: url.to_owned(),
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Most specific message in the error chain.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message = format!("{}: {}", message, cause);
        source = cause.source();
    }
    message
}

/// Errno-style name for the first I/O error in `err`'s chain.
pub fn error_code(err: &(dyn StdError + 'static)) -> &'static str {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_code(io_err);
        }
        current = e.source();
    }
    "EPROXY"
}

fn io_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::NotFound => "ENOTFOUND",
        io::ErrorKind::UnexpectedEof => "ECONNRESET",
        _ => match err.raw_os_error() {
            Some(113) => "EHOSTUNREACH",
            Some(101) => "ENETUNREACH",
            _ => "EIO",
        },
    }
}
