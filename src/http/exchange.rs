//! Per-exchange relay state machine.
//!
//! # States
//! ```text
//! Receiving ──RequestCaptured──▶ Forwarding ──ResponseHead──▶ RelayingResponse ──BackendEnded──▶ Completed
//!                                    │                              │
//!                                    ├─ForwardFailed─▶ FailedAtForward ─┐
//!                                    └─DeadlineElapsed─▶ TimedOut ──────┼─Finished─▶ Completed
//!                                          BackendFailed─▶ FailedAtResponse ─┘
//! ```
//!
//! Events that do not apply to the current state leave it unchanged. That is
//! what settles a forward failure racing the deadline: whichever lands first
//! moves the exchange out of `Forwarding`, the other is ignored.

use std::fmt;

use crate::net::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Receiving,
    Forwarding,
    RelayingResponse,
    FailedAtForward,
    TimedOut,
    FailedAtResponse,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Full request body received and captured.
    RequestCaptured,
    /// Backend status line and headers arrived.
    ResponseHead,
    /// Backend could not be reached or reset before responding.
    ForwardFailed,
    /// Response deadline passed before the head arrived.
    DeadlineElapsed,
    /// Backend body ended cleanly.
    BackendEnded,
    /// Backend body failed mid-stream.
    BackendFailed,
    /// The error branch has answered the client.
    Finished,
}

impl ExchangeState {
    /// Transition function.
    pub fn on(self, event: ExchangeEvent) -> ExchangeState {
        use ExchangeEvent as E;
        use ExchangeState as S;

        match (self, event) {
            (S::Receiving, E::RequestCaptured) => S::Forwarding,
            (S::Forwarding, E::ResponseHead) => S::RelayingResponse,
            (S::Forwarding, E::ForwardFailed) => S::FailedAtForward,
            (S::Forwarding, E::DeadlineElapsed) => S::TimedOut,
            (S::RelayingResponse, E::BackendEnded) => S::Completed,
            (S::RelayingResponse, E::BackendFailed) => S::FailedAtResponse,
            (S::FailedAtForward | S::TimedOut | S::FailedAtResponse, E::Finished) => S::Completed,
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Completed)
    }

    /// Whether this state may still put a status line on the wire.
    fn may_send_head(&self) -> bool {
        matches!(
            self,
            ExchangeState::Receiving
                | ExchangeState::Forwarding
                | ExchangeState::RelayingResponse
                | ExchangeState::FailedAtForward
                | ExchangeState::TimedOut
        )
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeState::Receiving => "receiving",
            ExchangeState::Forwarding => "forwarding",
            ExchangeState::RelayingResponse => "relaying_response",
            ExchangeState::FailedAtForward => "failed_at_forward",
            ExchangeState::TimedOut => "timed_out",
            ExchangeState::FailedAtResponse => "failed_at_response",
            ExchangeState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// One request/response cycle as it moves through the relay.
#[derive(Debug)]
pub struct Exchange {
    connection: ConnectionId,
    state: ExchangeState,
    headers_sent: bool,
}

impl Exchange {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            state: ExchangeState::Receiving,
            headers_sent: false,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Apply `event`. Returns whether the state changed.
    pub fn advance(&mut self, event: ExchangeEvent) -> bool {
        let next = self.state.on(event);
        if next == self.state {
            tracing::trace!(
                connection_id = %self.connection,
                state = %self.state,
                ?event,
                "Exchange event ignored"
            );
            return false;
        }
        tracing::trace!(
            connection_id = %self.connection,
            from = %self.state,
            to = %next,
            "Exchange transition"
        );
        self.state = next;
        true
    }

    /// Claim the right to write the response head. Succeeds at most once,
    /// and never after the backend stream has failed.
    pub fn begin_response(&mut self) -> bool {
        if self.headers_sent || !self.state.may_send_head() {
            return false;
        }
        self.headers_sent = true;
        true
    }
}
