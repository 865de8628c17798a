//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, live-connection accounting)
//!     → sniff.rs (CONNECT or plain HTTP?)
//!         CONNECT → tunnel.rs (opaque splice to the backend)
//!         other   → hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - CONNECT is detected on the raw socket so the reply is byte-exact

pub mod connection;
pub mod listener;
pub mod sniff;
pub mod tunnel;

pub use listener::{Listener, ListenerError};
