//! Single-slot observer hooks.
//!
//! Each slot holds at most one handler. Registering a handler replaces the
//! previous one; handlers are never queued or chained. Handlers run
//! synchronously on the relay task right after a record is captured, so they
//! should be quick.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::record::{CapturedRequest, CapturedResponse};

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A replace-on-register sink for one kind of record.
pub struct ObserverSlot<T> {
    handler: ArcSwapOption<Handler<T>>,
}

impl<T> ObserverSlot<T> {
    pub fn new() -> Self {
        Self {
            handler: ArcSwapOption::empty(),
        }
    }

    /// Install `handler`, dropping whichever handler was installed before.
    pub fn set<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Handler<T> = Box::new(handler);
        self.handler.store(Some(Arc::new(handler)));
    }

    pub fn clear(&self) {
        self.handler.store(None);
    }

    pub fn is_set(&self) -> bool {
        self.handler.load().is_some()
    }

    /// Invoke the current handler, if any. Returns whether one ran.
    pub fn notify(&self, record: &T) -> bool {
        match self.handler.load_full() {
            Some(handler) => {
                (**handler)(record);
                true
            }
            None => false,
        }
    }
}

impl<T> Default for ObserverSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ObserverSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// The request and response observers consulted by every relay.
#[derive(Debug, Default)]
pub struct Observers {
    request: ObserverSlot<CapturedRequest>,
    response: ObserverSlot<CapturedResponse>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the request observer. Last registration wins.
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(&CapturedRequest) + Send + Sync + 'static,
    {
        self.request.set(handler);
    }

    /// Register the response observer. Last registration wins.
    pub fn on_response<F>(&self, handler: F)
    where
        F: Fn(&CapturedResponse) + Send + Sync + 'static,
    {
        self.response.set(handler);
    }

    pub fn clear_request(&self) {
        self.request.clear();
    }

    pub fn clear_response(&self) {
        self.response.clear();
    }

    pub fn notify_request(&self, request: &CapturedRequest) -> bool {
        self.request.notify(request)
    }

    pub fn notify_response(&self, response: &CapturedResponse) -> bool {
        self.response.notify(response)
    }
}
