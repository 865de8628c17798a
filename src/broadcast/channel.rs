//! Best-effort fan-out of captured traffic.
//!
//! Every subscriber owns a small bounded outbound buffer. `publish` serializes
//! the envelope once and `try_send`s it to every subscriber that is open; a
//! subscriber that is still connecting, closing, gone or simply full misses
//! the message. Nothing is retried or replayed, and the relay never waits.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::capture::clock::{iso8601, Clock};
use crate::capture::record::{CapturedRequest, CapturedResponse};

/// Identifier of one subscriber.
pub type SubscriberId = Uuid;

/// Serialized envelope as delivered to subscribers.
pub type Message = Arc<str>;

/// Readiness of a subscriber. Only `Open` subscribers receive messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for SubscriberState {
    fn from(val: u8) -> Self {
        match val {
            0 => SubscriberState::Connecting,
            1 => SubscriberState::Open,
            2 => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }
}

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Request,
    Response,
}

/// A captured record on its way to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CaptureEvent {
    Request(CapturedRequest),
    Response(CapturedResponse),
}

impl CaptureEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CaptureEvent::Request(_) => EventKind::Request,
            CaptureEvent::Response(_) => EventKind::Response,
        }
    }
}

/// `{ "type", "data", "timestamp" }` wire message.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EventKind,
    data: CaptureEvent,
    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(data: CaptureEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: data.kind(),
            data,
            timestamp,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn data(&self) -> &CaptureEvent {
        &self.data
    }
}

#[derive(Debug)]
struct Subscriber {
    state: AtomicU8,
    sender: mpsc::Sender<Message>,
}

impl Subscriber {
    fn new(sender: mpsc::Sender<Message>, state: SubscriberState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            sender,
        }
    }

    fn state(&self) -> SubscriberState {
        SubscriberState::from(self.state.load(Ordering::Acquire))
    }
}

/// The process-wide broadcast channel.
#[derive(Debug)]
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, Subscriber>,
    buffer_size: usize,
    clock: Arc<dyn Clock>,
    /// Port of the subscriber endpoint, 0 when none is running.
    endpoint_port: AtomicU16,
}

impl Broadcaster {
    pub fn new(buffer_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer_size: buffer_size.max(1),
            clock,
            endpoint_port: AtomicU16::new(0),
        }
    }

    /// A bounded channel sized for one subscriber.
    pub fn channel(&self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(self.buffer_size)
    }

    /// Register `id` as an open subscriber. Re-subscribing replaces its sender.
    pub fn subscribe(&self, id: SubscriberId, sender: mpsc::Sender<Message>) {
        self.insert(id, sender, SubscriberState::Open);
    }

    /// Register `id` before its transport is ready; it receives nothing until
    /// marked [`SubscriberState::Open`].
    pub fn subscribe_pending(&self, id: SubscriberId, sender: mpsc::Sender<Message>) {
        self.insert(id, sender, SubscriberState::Connecting);
    }

    /// Create a channel, subscribe it and hand back the receiving end.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<Message>) {
        let id = Uuid::new_v4();
        let (tx, rx) = self.channel();
        self.subscribe(id, tx);
        (id, rx)
    }

    fn insert(&self, id: SubscriberId, sender: mpsc::Sender<Message>, state: SubscriberState) {
        if self
            .subscribers
            .insert(id, Subscriber::new(sender, state))
            .is_some()
        {
            tracing::debug!(subscriber = %id, "Subscriber re-registered");
        } else {
            tracing::debug!(subscriber = %id, ?state, "Subscriber registered");
        }
    }

    /// Update a subscriber's readiness. Returns false for unknown ids.
    pub fn set_state(&self, id: SubscriberId, state: SubscriberState) -> bool {
        match self.subscribers.get(&id) {
            Some(subscriber) => {
                subscriber.state.store(state as u8, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.subscribers.get(&id).map(|s| s.state())
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Subscribers currently eligible for delivery.
    pub fn open_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.state() == SubscriberState::Open)
            .count()
    }

    /// Wrap `event` in an envelope and deliver it to every open subscriber.
    ///
    /// Returns how many subscribers accepted the message.
    pub fn publish(&self, event: CaptureEvent) -> usize {
        let envelope = Envelope::new(event, self.clock.wall());
        let message: Message = match serde_json::to_string(&envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::warn!(error = %e, kind = ?envelope.kind(), "Failed to serialize envelope");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.state() != SubscriberState::Open {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(subscriber = %entry.key(), "Subscriber buffer full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    entry.state.store(SubscriberState::Closed as u8, Ordering::Release);
                    closed.push(*entry.key());
                }
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }

        tracing::trace!(kind = ?envelope.kind(), delivered, "Envelope published");
        delivered
    }

    /// Port of the running subscriber endpoint, if any.
    pub fn endpoint_port(&self) -> Option<u16> {
        match self.endpoint_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub(crate) fn set_endpoint_port(&self, port: Option<u16>) {
        self.endpoint_port.store(port.unwrap_or(0), Ordering::Release);
    }
}
