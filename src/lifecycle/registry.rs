//! Instance registry.
//!
//! # Responsibilities
//! - Start, stop and list relay instances keyed by identifier
//! - Serialize start/stop per identifier
//! - Own the single process-wide subscriber endpoint
//!
//! Starting an identifier that is already running fully stops the previous
//! instance (accept loop joined, listener dropped) before binding again.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broadcast::{Broadcaster, SubscriberServer};
use crate::capture::{Clock, Observers};
use crate::config::ProxyConfig;
use crate::http::{RelayContext, RelayServer};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::{Listener, ListenerError};

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An instance's listening port could not be bound.
    #[error("Instance '{id}' could not bind port {port}: {source}")]
    Bind {
        id: String,
        port: u16,
        #[source]
        source: ListenerError,
    },
    /// The subscriber endpoint could not be bound.
    #[error("Subscriber endpoint could not bind port {port}: {source}")]
    Channel {
        port: u16,
        #[source]
        source: ListenerError,
    },
}

/// Lifecycle of one instance.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    Stopped = 2,
}

impl From<u8> for LifecycleState {
    fn from(val: u8) -> Self {
        match val {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Snapshot of a registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub listen_port: u16,
    pub target_port: u16,
    pub state: LifecycleState,
    pub active_connections: u64,
}

struct Instance {
    listen_port: u16,
    target_port: u16,
    state: Arc<AtomicU8>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl Instance {
    fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    async fn stop(self, id: &str) {
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            tracing::warn!(instance_id = %id, error = %e, "Accept loop ended abnormally");
        }
        self.state.store(LifecycleState::Stopped as u8, Ordering::Release);
        tracing::info!(
            instance_id = %id,
            listen_port = self.listen_port,
            target_port = self.target_port,
            active_connections = self.tracker.active_count(),
            "Instance stopped"
        );
    }
}

/// Keyed set of relay instances sharing one broadcaster and one pair of
/// observer slots.
pub struct ProxyRegistry {
    context: RelayContext,
    instances: DashMap<String, Instance>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    channel: Mutex<Option<SubscriberServer>>,
}

impl ProxyRegistry {
    pub fn new(config: ProxyConfig) -> Self {
        Self::from_context(RelayContext::new(config))
    }

    /// Registry whose captures are timed by `clock`.
    pub fn with_clock(config: ProxyConfig, clock: Arc<dyn Clock>) -> Self {
        Self::from_context(RelayContext::with_clock(config, clock))
    }

    fn from_context(context: RelayContext) -> Self {
        Self {
            context,
            instances: DashMap::new(),
            locks: DashMap::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn observers(&self) -> &Observers {
        &self.context.observers
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.context.broadcaster
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_owned()).or_default().value())
    }

    /// Start (or restart) instance `id`. Returns the bound listening port.
    pub async fn start(&self, id: &str, listen_port: u16, target_port: u16) -> Result<u16, RegistryError> {
        let lock = self.lock_for(id);
        let _held = lock.lock().await;

        if let Some((_, previous)) = self.instances.remove(id) {
            tracing::info!(instance_id = %id, "Replacing running instance");
            previous.stop(id).await;
        }

        let config = &self.context.config;
        let listener = Listener::bind(&config.listener.bind_host, listen_port, config.listener.max_connections)
            .await
            .map_err(|source| RegistryError::Bind {
                id: id.to_owned(),
                port: listen_port,
                source,
            })?;
        let bound_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(listen_port);

        let server = RelayServer::new(self.context.clone(), target_port);
        let tracker = server.tracker();
        let shutdown = Shutdown::new();
        let state = Arc::new(AtomicU8::new(LifecycleState::Starting as u8));

        let task = {
            let shutdown = shutdown.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state.store(LifecycleState::Running as u8, Ordering::Release);
                server.run(listener, shutdown).await;
                state.store(LifecycleState::Stopped as u8, Ordering::Release);
            })
        };

        self.instances.insert(
            id.to_owned(),
            Instance {
                listen_port: bound_port,
                target_port,
                state,
                tracker,
                shutdown,
                task,
            },
        );

        tracing::info!(
            instance_id = %id,
            listen_port = bound_port,
            target_port,
            "Instance started"
        );
        Ok(bound_port)
    }

    /// Stop instance `id`. Returns whether it was registered.
    pub async fn stop(&self, id: &str) -> bool {
        let lock = self.lock_for(id);
        let _held = lock.lock().await;

        match self.instances.remove(id) {
            Some((_, instance)) => {
                instance.stop(id).await;
                true
            }
            None => false,
        }
    }

    /// Registered instances, ordered by id.
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .iter()
            .map(|entry| {
                let instance = entry.value();
                InstanceInfo {
                    id: entry.key().clone(),
                    listen_port: instance.listen_port,
                    target_port: instance.target_port,
                    state: instance.state(),
                    active_connections: instance.tracker.active_count(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Start the subscriber endpoint, replacing a running one. Returns the
    /// bound port.
    pub async fn start_channel(&self, port: u16) -> Result<u16, RegistryError> {
        let mut slot = self.channel.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }

        let server = SubscriberServer::start(
            &self.context.config.listener.bind_host,
            port,
            Arc::clone(&self.context.broadcaster),
        )
        .await
        .map_err(|source| RegistryError::Channel { port, source })?;

        let bound = server.port();
        *slot = Some(server);
        Ok(bound)
    }

    /// Stop the subscriber endpoint. Returns whether one was running.
    pub async fn stop_channel(&self) -> bool {
        match self.channel.lock().await.take() {
            Some(server) => {
                server.stop().await;
                true
            }
            None => false,
        }
    }

    /// Port of the running subscriber endpoint.
    pub fn channel_port(&self) -> Option<u16> {
        self.context.broadcaster.endpoint_port()
    }

    /// Stop the subscriber endpoint and every instance.
    pub async fn shutdown(&self) {
        self.stop_channel().await;

        let ids: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
        tracing::info!("Registry shut down");
    }
}
