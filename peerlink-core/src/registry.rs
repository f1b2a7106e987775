//! Endpoint registry: transport address <-> PeerId, and ownership of every connection.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionState};
use crate::identity::{Endpoint, PeerId};

#[derive(Debug, Default)]
pub struct Registry {
    by_endpoint: HashMap<Endpoint, PeerId>,
    connections: HashMap<PeerId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, endpoint: &Endpoint) -> Option<PeerId> {
        self.by_endpoint.get(endpoint).copied()
    }

    /// Create a connection for `endpoint` in Connecting under a fresh PeerId.
    /// Any connection previously registered for the endpoint is replaced; callers remove it first.
    pub fn admit(
        &mut self,
        endpoint: Endpoint,
        nonce: u64,
        config: &EngineConfig,
        now: Instant,
    ) -> PeerId {
        let peer_id = PeerId::generate();
        let mut conn = Connection::new(peer_id, endpoint, nonce, config, now);
        let entered = conn.transition(ConnectionState::Connecting);
        debug_assert!(entered.is_ok(), "fresh connection refused Connecting: {entered:?}");
        if let Some(old) = self.by_endpoint.insert(endpoint, peer_id) {
            self.connections.remove(&old);
        }
        self.connections.insert(peer_id, conn);
        peer_id
    }

    /// Remove a connection. Removing an unknown PeerId is a no-op.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Connection> {
        let conn = self.connections.remove(peer_id)?;
        if self.by_endpoint.get(&conn.endpoint()) == Some(peer_id) {
            self.by_endpoint.remove(&conn.endpoint());
        }
        Some(conn)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Connection> {
        self.connections.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_endpoint.clear();
        self.connections.clear();
    }
}

/// Handshakes refused recently, keyed by endpoint and nonce. Copies of a refused
/// `Connect` get the same answer without a second admission decision.
///
/// Bounded in size and age, and holds no PeerId: a refused endpoint never resolves.
#[derive(Debug)]
pub struct RejectedHandshakes {
    entries: VecDeque<(Endpoint, u64, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl RejectedHandshakes {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    /// Remember a refusal. The oldest entry goes when full.
    pub fn insert(&mut self, endpoint: Endpoint, nonce: u64, now: Instant) {
        self.expire(now);
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((endpoint, nonce, now));
    }

    pub fn contains(&mut self, endpoint: &Endpoint, nonce: u64, now: Instant) -> bool {
        self.expire(now);
        self.entries
            .iter()
            .any(|(e, n, _)| e == endpoint && *n == nonce)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(_, _, at)) = self.entries.front() {
            if now.saturating_duration_since(at) < self.ttl {
                break;
            }
            self.entries.pop_front();
        }
    }
}
