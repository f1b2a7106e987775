//! Server front-end: one bound socket, many peers.

use std::net::SocketAddr;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::connection::{ConnectionInfo, ConnectionState};
use crate::engine::{self, Engine, InitError, Listener, Role, Stats};
use crate::identity::{Endpoint, PeerId};
use crate::transport::{Transport, UdpTransport};

/// Accepts connections on one local address. Drive it by calling [`Server::process`] in a loop.
pub struct Server<T: Transport = UdpTransport> {
    engine: Engine<T>,
}

impl Server<UdpTransport> {
    /// Bind `address:port` with the default configuration.
    pub fn create(address: &str, port: u16) -> Result<Self, InitError> {
        Self::create_with_config(address, port, EngineConfig::default())
    }

    pub fn create_with_config(
        address: &str,
        port: u16,
        config: EngineConfig,
    ) -> Result<Self, InitError> {
        let local = engine::resolve_address(address, port)?;
        config.validate()?;
        let transport = UdpTransport::bind(local)?;
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> Server<T> {
    /// Run the server over a caller-supplied transport.
    pub fn with_transport(transport: T, config: EngineConfig) -> Result<Self, InitError> {
        Ok(Self {
            engine: Engine::new(Role::Server, config, transport)?,
        })
    }

    /// Replace the listener. Takes effect from the next `process()`.
    pub fn set_listener(&mut self, listener: impl Listener + Send + 'static) {
        self.engine.set_listener(Box::new(listener));
    }

    pub fn process(&mut self) {
        self.engine.process();
    }

    /// `process()` with an explicit clock reading. Sends between calls are stamped with the last `now`.
    pub fn process_at(&mut self, now: Instant) {
        self.engine.process_at(now);
    }

    pub fn send(&mut self, peer: PeerId, message_id: i64, payload: &[u8]) {
        self.engine.outbox().send(peer, message_id, payload);
    }

    pub fn send_reliable(&mut self, peer: PeerId, message_id: i64, payload: &[u8]) {
        self.engine.outbox().send_reliable(peer, message_id, payload);
    }

    pub fn broadcast(&mut self, message_id: i64, payload: &[u8]) {
        self.engine.outbox().broadcast(message_id, payload);
    }

    pub fn broadcast_reliable(&mut self, message_id: i64, payload: &[u8]) {
        self.engine.outbox().broadcast_reliable(message_id, payload);
    }

    /// Invoke `method_id` on one peer.
    pub fn call_rpc(
        &mut self,
        peer: PeerId,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    ) {
        self.engine
            .outbox()
            .call_rpc(peer, reliable, method_id, request_id, arg_type, arg_data);
    }

    pub fn call_rpc_broadcast(
        &mut self,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    ) {
        self.engine
            .outbox()
            .call_rpc_broadcast(reliable, method_id, request_id, arg_type, arg_data);
    }

    /// Begin a graceful teardown. The peer is removed once it acks or the grace period ends.
    pub fn disconnect(&mut self, peer: PeerId) {
        self.engine.outbox().disconnect(peer);
    }

    /// Connected peers and their endpoints.
    pub fn active_clients(&self) -> Vec<(PeerId, Endpoint)> {
        self.engine.connected_peers()
    }

    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.engine.connection_state(peer)
    }

    pub fn connection_info(&self, peer: &PeerId) -> Option<ConnectionInfo> {
        self.engine.connection_info(peer)
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    /// `None` once destroyed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.local_addr()
    }

    /// Tell every peer we are leaving, then release all connections and the socket. Idempotent.
    pub fn destroy(&mut self) {
        self.engine.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.engine.is_destroyed()
    }
}
