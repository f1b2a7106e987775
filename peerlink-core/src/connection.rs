//! Per-peer connection: lifecycle state plus the reliability and liveness bookkeeping.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::identity::{Endpoint, PeerId};
use crate::reliability::{ReliableReceiver, ReliableSender};

/// Lifecycle of one connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (None, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Connecting or Connected.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::None => "none",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// One admitted peer. Owned by the registry; everything else refers to it by `PeerId`.
#[derive(Debug)]
pub struct Connection {
    peer_id: PeerId,
    endpoint: Endpoint,
    state: ConnectionState,
    /// Handshake nonce chosen by the client side.
    nonce: u64,
    pub(crate) sender: ReliableSender,
    pub(crate) receiver: ReliableReceiver,
    pub(crate) last_received: Instant,
    pub(crate) last_sent: Instant,
    /// Connect or Disconnect sends so far in the current phase.
    pub(crate) control_attempts: u32,
    pub(crate) last_control_sent: Option<Instant>,
    /// When Disconnecting was entered.
    pub(crate) teardown_started: Option<Instant>,
}

impl Connection {
    /// New connection in `None`; the registry moves it to Connecting on admission.
    pub fn new(
        peer_id: PeerId,
        endpoint: Endpoint,
        nonce: u64,
        config: &EngineConfig,
        now: Instant,
    ) -> Self {
        Self {
            peer_id,
            endpoint,
            state: ConnectionState::None,
            nonce,
            sender: ReliableSender::new(config),
            receiver: ReliableReceiver::new(config),
            last_received: now,
            last_sent: now,
            control_attempts: 0,
            last_control_sent: None,
            teardown_started: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Move to `next`. Returns the previous state.
    pub fn transition(&mut self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.state = next;
        Ok(from)
    }

    /// Enter Disconnecting: queues and in-flight packets are dropped, Disconnect resends start over.
    pub(crate) fn begin_teardown(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        self.transition(ConnectionState::Disconnecting)?;
        self.sender.clear();
        self.receiver.clear();
        self.control_attempts = 0;
        self.last_control_sent = None;
        self.teardown_started = Some(now);
        Ok(())
    }

    pub(crate) fn mark_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// A control frame is due if none was sent yet or `interval` has passed since the last one.
    pub(crate) fn control_due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_control_sent {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        }
    }

    pub(crate) fn record_control_sent(&mut self, now: Instant) {
        self.control_attempts += 1;
        self.last_control_sent = Some(now);
        self.last_sent = now;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.peer_id,
            endpoint: self.endpoint,
            state: self.state,
            in_flight: self.sender.in_flight_len(),
            queued: self.sender.queued_len(),
            rto: self.sender.timer().rto(),
            srtt: self.sender.timer().srtt(),
        }
    }
}

/// Read-only snapshot of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub endpoint: Endpoint,
    pub state: ConnectionState,
    pub in_flight: usize,
    pub queued: usize,
    pub rto: Duration,
    pub srtt: Option<Duration>,
}
