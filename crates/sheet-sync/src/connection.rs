//! Subscription lifecycle for one sheet session.
//!
//! ```text
//! CLOSED ──subscribe──▶ SUBSCRIBING ──handshake ok──▶ SUBSCRIBED
//!   ▲                       │                             │
//!   │                 handshake failed             transport failure
//!   │                       ▼                             ▼
//!   └──────teardown──────  ERROR  ◀────────────────────────┘
//! ```
//!
//! Any state can be torn down to `CLOSED`, and `subscribe` restarts the
//! handshake from any state. There is no automatic reconnect: the owner
//! re-invokes `subscribe`, and every pass through `SUBSCRIBING` bumps the
//! epoch so signals from an older subscription can be told apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Subscribing,
    Subscribed,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Subscribe,
    HandshakeSucceeded,
    HandshakeFailed(String),
    TransportFailed(String),
    Teardown,
}

/// What the UI observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub epoch: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid connection transition from {from} on {event:?}")]
pub struct TransitionRejected {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    epoch: u64,
    last_error: Option<String>,
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Closed,
            epoch: 0,
            last_error: None,
        });
        Self {
            state: ConnectionState::Closed,
            epoch: 0,
            last_error: None,
            tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, TransitionRejected> {
        let next = match (self.state, &event) {
            (_, ConnectionEvent::Subscribe) => Some(ConnectionState::Subscribing),
            (_, ConnectionEvent::Teardown) => Some(ConnectionState::Closed),
            (ConnectionState::Subscribing, ConnectionEvent::HandshakeSucceeded) => {
                Some(ConnectionState::Subscribed)
            }
            (ConnectionState::Subscribing, ConnectionEvent::HandshakeFailed(_))
            | (ConnectionState::Subscribed, ConnectionEvent::TransportFailed(_)) => {
                Some(ConnectionState::Error)
            }
            _ => None,
        };
        let Some(next) = next else {
            warn!(
                target = "sheet.connection",
                from = %self.state,
                event = ?event,
                "rejected connection transition"
            );
            return Err(TransitionRejected {
                from: self.state,
                event,
            });
        };

        match event {
            ConnectionEvent::Subscribe => {
                self.epoch += 1;
                self.last_error = None;
            }
            ConnectionEvent::HandshakeFailed(reason) | ConnectionEvent::TransportFailed(reason) => {
                self.last_error = Some(reason);
            }
            ConnectionEvent::HandshakeSucceeded | ConnectionEvent::Teardown => {}
        }

        debug!(
            target = "sheet.connection",
            from = %self.state,
            to = %next,
            epoch = self.epoch,
            "connection transition"
        );
        self.state = next;
        metrics::CONNECTION_TRANSITIONS
            .with_label_values(&[next.as_str()])
            .inc();
        self.tx.send_replace(ConnectionStatus {
            state: self.state,
            epoch: self.epoch,
            last_error: self.last_error.clone(),
        });
        Ok(next)
    }
}
