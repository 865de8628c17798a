//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Registry (registry.rs):
//!     start(id) → stop previous → bind → spawn accept loop
//!     stop(id)  → trigger shutdown → join accept loop → port freed
//!
//! Shutdown (shutdown.rs):
//!     Trigger → accept loop exits → connections drain gracefully
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → registry shutdown
//! ```

pub mod registry;
pub mod shutdown;
pub mod signals;

pub use registry::{InstanceInfo, LifecycleState, ProxyRegistry, RegistryError};
pub use shutdown::Shutdown;
