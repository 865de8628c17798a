//! Per-identifier capturing reverse proxy.
//!
//! Each instance listens on one port, forwards every request to
//! `localhost:<target>`, captures both sides of the exchange and fans the
//! captures out to live subscribers. CONNECT requests are tunnelled opaquely.

// Capture pipeline
pub mod broadcast;
pub mod capture;

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use broadcast::{Broadcaster, CaptureEvent, SubscriberServer};
pub use capture::{CapturedRequest, CapturedResponse, Observers};
pub use config::schema::ProxyConfig;
pub use lifecycle::{ProxyRegistry, RegistryError, Shutdown};
