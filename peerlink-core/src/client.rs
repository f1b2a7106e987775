//! Client front-end: ephemeral local socket, exactly one server.

use std::net::SocketAddr;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::connection::{ConnectionInfo, ConnectionState};
use crate::engine::{self, Engine, InitError, Listener, Role, Stats};
use crate::identity::{Endpoint, PeerId};
use crate::transport::{Transport, UdpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("already connecting or connected")]
    AlreadyConnected,
    #[error("client destroyed")]
    Destroyed,
}

/// Talks to a single server. Call [`Client::connect`], then pump with [`Client::process`].
pub struct Client<T: Transport = UdpTransport> {
    engine: Engine<T>,
    server: Endpoint,
    /// Connection of the latest `connect()`; cleared only by a new `connect()`.
    peer: Option<PeerId>,
}

impl Client<UdpTransport> {
    /// Resolve the server address and bind an ephemeral local port.
    pub fn create(server_address: &str, port: u16) -> Result<Self, InitError> {
        Self::create_with_config(server_address, port, EngineConfig::default())
    }

    pub fn create_with_config(
        server_address: &str,
        port: u16,
        config: EngineConfig,
    ) -> Result<Self, InitError> {
        let server = engine::resolve_address(server_address, port)?;
        config.validate()?;
        let transport = UdpTransport::bind_ephemeral_for(server)?;
        Self::with_transport(transport, server, config)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(
        transport: T,
        server: SocketAddr,
        config: EngineConfig,
    ) -> Result<Self, InitError> {
        Ok(Self {
            engine: Engine::new(Role::Client, config, transport)?,
            server: Endpoint::from(server),
            peer: None,
        })
    }

    pub fn set_listener(&mut self, listener: impl Listener + Send + 'static) {
        self.engine.set_listener(Box::new(listener));
    }

    /// Start the handshake. Progress and the outcome arrive through the listener.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if self.engine.is_destroyed() {
            return Err(ConnectError::Destroyed);
        }
        if self.peer.and_then(|p| self.engine.connection_state(&p)).is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.peer = Some(self.engine.open(self.server));
        Ok(())
    }

    /// Begin a graceful teardown of the server connection.
    pub fn disconnect(&mut self) {
        if let Some(peer) = self.peer {
            self.engine.outbox().disconnect(peer);
        }
    }

    /// `None` before the first `connect()`, `Disconnected` once that connection is gone.
    pub fn state(&self) -> ConnectionState {
        match self.peer {
            None => ConnectionState::None,
            Some(peer) => self
                .engine
                .connection_state(&peer)
                .unwrap_or(ConnectionState::Disconnected),
        }
    }

    /// Identity of the server connection, once `connect()` was called.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn server(&self) -> Endpoint {
        self.server
    }

    pub fn process(&mut self) {
        self.engine.process();
    }

    pub fn process_at(&mut self, now: Instant) {
        self.engine.process_at(now);
    }

    /// Unreliable send to the server. Dropped unless connected.
    pub fn send(&mut self, message_id: i64, payload: &[u8]) {
        match self.peer {
            Some(peer) => self.engine.outbox().send(peer, message_id, payload),
            None => tracing::debug!(message_id, "Send before connect dropped"),
        }
    }

    /// Reliable, ordered send to the server. Dropped unless connected.
    pub fn send_reliable(&mut self, message_id: i64, payload: &[u8]) {
        match self.peer {
            Some(peer) => self.engine.outbox().send_reliable(peer, message_id, payload),
            None => tracing::debug!(message_id, "Send before connect dropped"),
        }
    }

    /// Invoke `method_id` on the server. Dropped unless connected.
    pub fn call_rpc(
        &mut self,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    ) {
        match self.peer {
            Some(peer) => self
                .engine
                .outbox()
                .call_rpc(peer, reliable, method_id, request_id, arg_type, arg_data),
            None => tracing::debug!(method_id, "RPC before connect dropped"),
        }
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.peer.and_then(|p| self.engine.connection_info(&p))
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.local_addr()
    }

    /// Best-effort Disconnect to the server, then release the socket. Idempotent.
    pub fn destroy(&mut self) {
        self.engine.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.engine.is_destroyed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FaultConfig, SimNetwork};

    fn sim_client(net: &SimNetwork, config: EngineConfig) -> Client<crate::simulator::SimTransport> {
        let local: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let server: SocketAddr = "10.0.0.1:55655".parse().unwrap();
        Client::with_transport(net.bind(local).unwrap(), server, config).unwrap()
    }

    #[test]
    fn state_before_connect_is_none() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let client = sim_client(&net, EngineConfig::default());
        assert_eq!(client.state(), ConnectionState::None);
        assert_eq!(client.peer_id(), None);
    }

    #[test]
    fn second_connect_is_refused() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut client = sim_client(&net, EngineConfig::default());
        client.connect().unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.connect(), Err(ConnectError::AlreadyConnected));
        client.destroy();
        assert_eq!(client.connect(), Err(ConnectError::Destroyed));
    }

    #[test]
    fn handshake_times_out_without_server() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let config = EngineConfig {
            handshake_attempts: 3,
            handshake_interval_ms: 100,
            ..EngineConfig::default()
        };
        let mut client = sim_client(&net, config);
        client.connect().unwrap();
        let start = Instant::now();
        for step in 0..10u64 {
            client.process_at(start + std::time::Duration::from_millis(step * 100));
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.connection_info().is_none());
        // a fresh attempt is allowed afterwards
        client.connect().unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
    }

    #[test]
    fn send_before_connect_is_dropped() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut client = sim_client(&net, EngineConfig::default());
        client.send(1, b"early");
        client.send_reliable(2, b"early");
        client.call_rpc(true, 3, 1, 0, b"early");
        assert_eq!(client.stats().datagrams_out, 0);
    }
}
