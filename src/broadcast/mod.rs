//! Broadcast subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP relay
//!     → channel.rs (Broadcaster::publish → envelope → try_send per subscriber)
//!     → server.rs (one task per WebSocket, text frame per envelope)
//!     → live subscribers
//! ```
//!
//! # Design Decisions
//! - At-most-once, best-effort: no retry, no replay
//! - A slow or dead subscriber never slows the relay
//! - One broadcaster per process, shared by every instance

pub mod channel;
pub mod server;

pub use channel::{
    Broadcaster, CaptureEvent, Envelope, EventKind, SubscriberId, SubscriberState,
};
pub use server::SubscriberServer;
