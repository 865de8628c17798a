//! HTTP relay subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs   (accept, sniff CONNECT, hand the rest to hyper)
//!     → relay.rs    (health, capture, forward, stream back)
//!     → exchange.rs (per-exchange state machine)
//!     → response.rs (502 / 504 / 4xx bodies)
//! ```

pub mod exchange;
pub mod health;
pub mod relay;
pub mod response;
pub mod server;

pub use server::{AppState, RelayContext, RelayServer};

/// Host every relay and tunnel dials.
pub const BACKEND_HOST: &str = "localhost";
