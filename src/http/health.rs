//! Reserved health endpoint answered by the relay itself.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::clock::iso8601;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub proxy: &'static str,
    /// Backend port this instance relays to.
    pub relay_port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket_port: Option<u16>,
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(target_port: u16, web_socket_port: Option<u16>, now: DateTime<Utc>) -> Self {
        Self {
            status: "ok",
            proxy: "active",
            relay_port: target_port.to_string(),
            web_socket_port,
            timestamp: now,
        }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
