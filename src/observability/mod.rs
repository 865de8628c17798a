//! Observability subsystem.
//!
//! Every subsystem emits structured `tracing` events (instance id, ports,
//! method, url, status, duration). `logging.rs` installs the subscriber that
//! renders them as pretty or JSON lines.

pub mod logging;
