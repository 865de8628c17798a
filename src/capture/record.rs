//! Captured request/response records and the recorders that build them.
//!
//! # Lifecycle
//! ```text
//! RequestRecorder::new(parts) → push(chunk)* → finish() → CapturedRequest
//! ResponseRecorder::new(request, parts) → push(chunk)* → finish() → CapturedResponse
//! ```
//!
//! Records are immutable once built. A response record owns the request it
//! answers, so one can never exist without the other.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::http::{header, request, response, HeaderMap};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::capture::clock::{elapsed_millis, iso8601, Clock};
use crate::capture::codec::{self, BodyEncoding};

/// One header's value(s). Repeated headers keep every value, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderEntry {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderEntry {
    /// The first value of the header.
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderEntry::Single(value) => Some(value),
            HeaderEntry::Multiple(values) => values.first().map(String::as_str),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderEntry::Single(value) => vec![value.as_str()],
            HeaderEntry::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Snapshot of a header map with lower-cased keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapturedHeaders(BTreeMap<String, HeaderEntry>);

impl CapturedHeaders {
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = BTreeMap::new();
        for name in map.keys() {
            let mut values: Vec<String> = map
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let entry = if values.len() == 1 {
                HeaderEntry::Single(values.remove(0))
            } else {
                HeaderEntry::Multiple(values)
            };
            headers.insert(name.as_str().to_owned(), entry);
        }
        Self(headers)
    }

    /// Look up a header by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&HeaderEntry> {
        self.0.get(&name.to_ascii_lowercase())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderEntry::first)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderEntry)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request as received from the client, body included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedRequest {
    method: String,
    url: String,
    headers: CapturedHeaders,
    body: String,
    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

impl CapturedRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path and query exactly as the client sent them.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &CapturedHeaders {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }
}

/// A backend response with its body decoded, tied to its request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    status_code: u16,
    status_message: String,
    headers: CapturedHeaders,
    body: String,
    #[serde(skip_serializing_if = "BodyEncoding::is_utf8")]
    body_encoding: BodyEncoding,
    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,
    /// Milliseconds from request received to response complete.
    duration: u64,
    request: CapturedRequest,
}

impl CapturedResponse {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn headers(&self) -> &CapturedHeaders {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn body_encoding(&self) -> BodyEncoding {
        self.body_encoding
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration
    }

    pub fn request(&self) -> &CapturedRequest {
        &self.request
    }
}

/// Accumulates an inbound request body.
#[derive(Debug)]
pub struct RequestRecorder {
    method: String,
    url: String,
    headers: CapturedHeaders,
    ip: Option<String>,
    body: BytesMut,
}

impl RequestRecorder {
    pub fn new(parts: &request::Parts, origin: Option<SocketAddr>) -> Self {
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());

        Self {
            method: parts.method.as_str().to_owned(),
            url,
            headers: CapturedHeaders::from_header_map(&parts.headers),
            ip: origin.map(|addr| addr.ip().to_string()),
            body: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Seal the record. Also hands back the raw body for forwarding.
    pub fn finish(self, clock: &dyn Clock) -> (CapturedRequest, Bytes) {
        let raw = self.body.freeze();
        let request = CapturedRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: String::from_utf8_lossy(&raw).into_owned(),
            timestamp: clock.wall(),
            ip: self.ip,
        };
        (request, raw)
    }
}

/// Buffers a backend response body until the stream ends.
#[derive(Debug)]
pub struct ResponseRecorder {
    request: CapturedRequest,
    received_at: Instant,
    status_code: u16,
    status_message: String,
    headers: CapturedHeaders,
    body: BytesMut,
}

impl ResponseRecorder {
    /// `received_at` is when the inbound request arrived, on the same clock
    /// later passed to [`finish`](Self::finish).
    pub fn new(request: CapturedRequest, received_at: Instant, parts: &response::Parts) -> Self {
        let status_message = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .or_else(|| parts.status.canonical_reason().map(str::to_owned))
            .unwrap_or_default();

        Self {
            request,
            received_at,
            status_code: parts.status.as_u16(),
            status_message,
            headers: CapturedHeaders::from_header_map(&parts.headers),
            body: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Decode the buffered body and seal the record.
    pub fn finish(self, clock: &dyn Clock) -> CapturedResponse {
        let encoding = self.headers.first(header::CONTENT_ENCODING.as_str());
        let decoded = codec::decode(&self.body, encoding);

        CapturedResponse {
            status_code: self.status_code,
            status_message: self.status_message,
            body: decoded.text,
            body_encoding: decoded.encoding,
            headers: self.headers,
            timestamp: clock.wall(),
            duration: elapsed_millis(self.received_at, clock.now()),
            request: self.request,
        }
    }
}
