//! Dispatch engine shared by [`crate::Server`] and [`crate::Client`].
//!
//! Host-driven: nothing happens between calls. One `process_at` drains a bounded
//! batch of datagrams, routes control frames to the connection state machine and
//! data frames to the reliability layer, drives every connection's timers, then
//! hands queued events to the listener in the order they occurred.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Instant;

use crate::config::{ConfigError, EngineConfig};
use crate::connection::{ConnectionInfo, ConnectionState};
use crate::identity::{Endpoint, PeerId};
use crate::protocol::{Control, RpcCall};
use crate::registry::{RejectedHandshakes, Registry};
use crate::reliability::Receipt;
use crate::transport::{self, Transport};
use crate::wire::{self, DataFrame, Frame, RpcHeader};

/// Receive buffer size; any UDP datagram fits.
const RECV_BUF_LEN: usize = 65_536;

/// Refused handshakes remembered at once.
const REJECTED_HANDSHAKES: usize = 256;

/// Application callbacks. Every method has a default, so implement only what you need.
/// All of them run inside `process()`.
pub trait Listener {
    /// Server only: admit a peer that asked to connect. Default accepts.
    fn on_connection_request(&mut self, endpoint: &Endpoint) -> bool {
        let _ = endpoint;
        true
    }

    fn on_state_changed(
        &mut self,
        out: &mut dyn Outbox,
        peer: PeerId,
        endpoint: Endpoint,
        state: ConnectionState,
    ) {
        let _ = (out, peer, endpoint, state);
    }

    fn on_message(
        &mut self,
        out: &mut dyn Outbox,
        peer: PeerId,
        endpoint: Endpoint,
        message_id: i64,
        payload: Vec<u8>,
    ) {
        let _ = (out, peer, endpoint, message_id, payload);
    }

    fn on_rpc(&mut self, out: &mut dyn Outbox, peer: PeerId, endpoint: Endpoint, call: RpcCall) {
        let _ = (out, peer, endpoint, call);
    }
}

/// Accepts every connection and ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultListener;

impl Listener for DefaultListener {}

/// Sending surface available from inside callbacks. Failures are silent drops counted in [`Stats`].
pub trait Outbox {
    fn send(&mut self, peer: PeerId, message_id: i64, payload: &[u8]);
    fn send_reliable(&mut self, peer: PeerId, message_id: i64, payload: &[u8]);
    /// Unreliable send to every connected peer.
    fn broadcast(&mut self, message_id: i64, payload: &[u8]);
    /// Reliable send to every connected peer.
    fn broadcast_reliable(&mut self, message_id: i64, payload: &[u8]);
    /// Start a graceful teardown of `peer`.
    fn disconnect(&mut self, peer: PeerId);
    /// Invoke `method_id` on `peer`. Reliable calls are ordered with `send_reliable` traffic.
    fn call_rpc(
        &mut self,
        peer: PeerId,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    );
    /// `call_rpc` to every connected peer.
    fn call_rpc_broadcast(
        &mut self,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    );
}

/// Engine-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Data or control frames from endpoints with no connection.
    pub unknown_peer: u64,
    /// Control frames that make no sense in the connection's current state or role.
    pub unexpected_control: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    pub retransmissions: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    /// Sends dropped locally: unknown or unconnected peer, oversized payload, full socket buffer.
    pub dropped_sends: u64,
    /// Messages and RPC calls handed to the listener.
    pub delivered: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// Fatal construction error.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("bind failed: {0}")]
    Bind(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Parse `address` as an IP literal, falling back to name resolution (first result wins).
pub(crate) fn resolve_address(address: &str, port: u16) -> Result<SocketAddr, InitError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (address, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| InitError::InvalidAddress(address.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

#[derive(Debug)]
enum Event {
    StateChanged {
        peer: PeerId,
        endpoint: Endpoint,
        state: ConnectionState,
    },
    Message {
        peer: PeerId,
        endpoint: Endpoint,
        message_id: i64,
        payload: Vec<u8>,
    },
    Rpc {
        peer: PeerId,
        endpoint: Endpoint,
        call: RpcCall,
    },
}

/// Socket plus the I/O counters; kept apart from the registry so both can be borrowed at once.
struct Io<T> {
    transport: Option<T>,
    v6_socket: bool,
    stats: Stats,
}

impl<T: Transport> Io<T> {
    /// IPv4 targets are mapped when the socket is IPv6.
    fn target(&self, to: Endpoint) -> SocketAddr {
        let addr = to.socket_addr();
        match addr {
            SocketAddr::V4(v4) if self.v6_socket => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            _ => addr,
        }
    }

    fn send(&mut self, to: Endpoint, datagram: &[u8]) -> bool {
        let target = self.target(to);
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send_to(datagram, target) {
            Ok(()) => {
                self.stats.datagrams_out += 1;
                self.stats.bytes_out += datagram.len() as u64;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.dropped_sends += 1;
                tracing::debug!(addr = %to, "Socket buffer full, datagram dropped");
                false
            }
            Err(e) => {
                self.stats.send_errors += 1;
                tracing::warn!(addr = %to, error = %e, "Send failed");
                false
            }
        }
    }

    fn send_control(&mut self, to: Endpoint, control: &Control) -> bool {
        match wire::encode_control(control) {
            Ok(bytes) => self.send(to, &bytes),
            Err(e) => {
                tracing::warn!(addr = %to, error = %e, "Failed to encode control frame");
                false
            }
        }
    }
}

/// Engine state minus the listener. Implements [`Outbox`] so callbacks can send.
struct Core<T> {
    role: Role,
    config: EngineConfig,
    io: Io<T>,
    registry: Registry,
    rejected: RejectedHandshakes,
    events: VecDeque<Event>,
    recv_buf: Vec<u8>,
    now: Instant,
    /// Set while the host pumps with `process()`; sends between pumps then read the clock.
    wall_clock: bool,
}

impl<T: Transport> Core<T> {
    fn receive_batch(&mut self, listener: &mut dyn Listener) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        for _ in 0..self.config.batch_size {
            let Some(socket) = self.io.transport.as_mut() else {
                break;
            };
            match socket.recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    self.io.stats.datagrams_in += 1;
                    self.io.stats.bytes_in += n as u64;
                    self.handle_datagram(listener, &buf[..n], Endpoint::from(from));
                }
                Ok(None) => break,
                Err(e) if transport::is_transient(&e) => {
                    self.io.stats.recv_errors += 1;
                    tracing::debug!(error = %e, "Transient receive error");
                }
                Err(e) => {
                    self.io.stats.recv_errors += 1;
                    tracing::warn!(error = %e, "Receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn handle_datagram(&mut self, listener: &mut dyn Listener, bytes: &[u8], from: Endpoint) {
        match wire::decode_frame(bytes) {
            Ok(Frame::Control(control)) => self.on_control(listener, from, control),
            Ok(Frame::Data(frame)) => self.on_data(from, frame),
            Err(e) => {
                self.io.stats.malformed += 1;
                tracing::debug!(addr = %from, error = %e, "Dropping malformed datagram");
            }
        }
    }

    fn on_data(&mut self, from: Endpoint, frame: DataFrame) {
        let Some(peer) = self.registry.resolve(&from) else {
            self.io.stats.unknown_peer += 1;
            tracing::debug!(addr = %from, "Data from unknown endpoint");
            return;
        };
        let Some(conn) = self.registry.get_mut(&peer) else {
            return;
        };
        conn.mark_received(self.now);
        if conn.state() != ConnectionState::Connected {
            tracing::debug!(peer = %peer, state = %conn.state(), "Data outside Connected dropped");
            return;
        }

        let Some(seq) = frame.seq else {
            self.deliver(peer, from, frame);
            return;
        };

        let receipt = conn.receiver.on_segment(seq, frame);
        if receipt.should_ack() {
            conn.mark_sent(self.now);
            self.io.send_control(from, &Control::Ack { seq });
        }
        match receipt {
            Receipt::Delivered(frames) => {
                for frame in frames {
                    self.deliver(peer, from, frame);
                }
            }
            Receipt::Buffered => {}
            Receipt::Duplicate => self.io.stats.duplicates += 1,
            Receipt::OutOfWindow => {
                self.io.stats.out_of_window += 1;
                tracing::debug!(peer = %peer, seq, "Reliable frame beyond receive window");
            }
        }
    }

    fn deliver(&mut self, peer: PeerId, endpoint: Endpoint, frame: DataFrame) {
        self.io.stats.delivered += 1;
        let reliable = frame.is_reliable();
        let DataFrame {
            message_id,
            rpc,
            payload,
            ..
        } = frame;
        let event = match rpc {
            None => Event::Message {
                peer,
                endpoint,
                message_id,
                payload,
            },
            Some(RpcHeader {
                request_id,
                arg_type,
            }) => Event::Rpc {
                peer,
                endpoint,
                call: RpcCall {
                    reliable,
                    method_id: message_id,
                    request_id,
                    arg_type,
                    arg_data: payload,
                },
            },
        };
        self.events.push_back(event);
    }

    fn on_control(&mut self, listener: &mut dyn Listener, from: Endpoint, control: Control) {
        if let Control::Connect { nonce } = control {
            self.on_connect(listener, from, nonce);
            return;
        }

        let Some(peer) = self.registry.resolve(&from) else {
            if control == Control::Disconnect {
                // Stateless reply so the remote side can finish its teardown.
                self.io.send_control(from, &Control::DisconnectAck);
            } else {
                self.io.stats.unknown_peer += 1;
                tracing::debug!(addr = %from, ?control, "Control from unknown endpoint");
            }
            return;
        };
        let Some(conn) = self.registry.get_mut(&peer) else {
            return;
        };
        conn.mark_received(self.now);
        let state = conn.state();

        match control {
            Control::Connect { .. } => {}
            Control::Accept { nonce } | Control::Reject { nonce }
                if self.role == Role::Client
                    && state == ConnectionState::Connecting
                    && nonce == conn.nonce() =>
            {
                if matches!(control, Control::Accept { .. }) {
                    self.change_state(peer, ConnectionState::Connected);
                } else {
                    tracing::info!(peer = %peer, addr = %from, "Connection rejected by server");
                    self.change_state(peer, ConnectionState::Disconnected);
                }
            }
            Control::Ack { seq } if state == ConnectionState::Connected => {
                if !conn.sender.on_ack(seq, self.now) {
                    return;
                }
                let fresh = conn.sender.poll_transmit(self.now);
                if !fresh.is_empty() {
                    conn.mark_sent(self.now);
                }
                for datagram in fresh {
                    self.io.send(from, &datagram);
                }
            }
            Control::Ack { .. } => {}
            Control::Disconnect => {
                self.io.send_control(from, &Control::DisconnectAck);
                if state == ConnectionState::Connected {
                    tracing::info!(peer = %peer, addr = %from, "Remote disconnect");
                    self.change_state(peer, ConnectionState::Disconnecting);
                }
                self.change_state(peer, ConnectionState::Disconnected);
            }
            Control::DisconnectAck if state == ConnectionState::Disconnecting => {
                self.change_state(peer, ConnectionState::Disconnected);
            }
            Control::Heartbeat => {}
            _ => {
                self.io.stats.unexpected_control += 1;
                tracing::debug!(peer = %peer, ?control, %state, "Unexpected control frame");
            }
        }
    }

    fn on_connect(&mut self, listener: &mut dyn Listener, from: Endpoint, nonce: u64) {
        if self.role != Role::Server {
            self.io.stats.unexpected_control += 1;
            return;
        }
        if self.rejected.contains(&from, nonce, self.now) {
            tracing::debug!(addr = %from, nonce, "Repeated handshake already refused");
            self.io.send_control(from, &Control::Reject { nonce });
            return;
        }

        if let Some(peer) = self.registry.resolve(&from) {
            let Some(conn) = self.registry.get_mut(&peer) else {
                return;
            };
            conn.mark_received(self.now);
            match conn.state() {
                ConnectionState::Connected if conn.nonce() == nonce => {
                    // Our Accept was lost.
                    self.io.send_control(from, &Control::Accept { nonce });
                    return;
                }
                ConnectionState::Disconnecting => return,
                _ => {
                    // Same address, new handshake: the old session is gone.
                    tracing::info!(peer = %peer, addr = %from, "Peer reconnected, replacing connection");
                    self.change_state(peer, ConnectionState::Disconnecting);
                    self.change_state(peer, ConnectionState::Disconnected);
                }
            }
        }

        if self.registry.len() >= self.config.max_connections {
            self.io.stats.rejected += 1;
            tracing::warn!(addr = %from, max = self.config.max_connections, "Connection limit reached, rejecting");
            self.reject(from, nonce);
            return;
        }
        if !listener.on_connection_request(&from) {
            self.io.stats.rejected += 1;
            tracing::info!(addr = %from, "Connection request rejected");
            self.reject(from, nonce);
            return;
        }

        let peer = self.registry.admit(from, nonce, &self.config, self.now);
        self.io.stats.accepted += 1;
        self.events.push_back(Event::StateChanged {
            peer,
            endpoint: from,
            state: ConnectionState::Connecting,
        });
        self.change_state(peer, ConnectionState::Connected);
        if let Some(conn) = self.registry.get_mut(&peer) {
            conn.mark_sent(self.now);
        }
        self.io.send_control(from, &Control::Accept { nonce });
    }

    fn reject(&mut self, to: Endpoint, nonce: u64) {
        self.rejected.insert(to, nonce, self.now);
        self.io.send_control(to, &Control::Reject { nonce });
    }

    /// Apply a transition, queue its event, and retire the connection on Disconnected.
    fn change_state(&mut self, peer: PeerId, next: ConnectionState) -> bool {
        let Some(conn) = self.registry.get_mut(&peer) else {
            return false;
        };
        let endpoint = conn.endpoint();
        let result = if next == ConnectionState::Disconnecting {
            conn.begin_teardown(self.now)
        } else {
            conn.transition(next).map(|_| ())
        };
        if let Err(e) = result {
            tracing::debug!(peer = %peer, error = %e, "Transition refused");
            return false;
        }
        tracing::info!(peer = %peer, addr = %endpoint, state = %next, "Connection state changed");
        if next == ConnectionState::Disconnected {
            self.registry.remove(&peer);
        }
        self.events.push_back(Event::StateChanged {
            peer,
            endpoint,
            state: next,
        });
        true
    }

    /// Client side: admit the server locally and send the first Connect.
    fn open(&mut self, server: Endpoint) -> PeerId {
        let nonce = rand::random::<u64>();
        let peer = self.registry.admit(server, nonce, &self.config, self.now);
        self.events.push_back(Event::StateChanged {
            peer,
            endpoint: server,
            state: ConnectionState::Connecting,
        });
        tracing::info!(peer = %peer, addr = %server, "Connecting");
        self.drive_connecting(peer);
        peer
    }

    fn teardown_local(&mut self, peer: PeerId) {
        let open = self
            .registry
            .get(&peer)
            .is_some_and(|c| c.state().is_open());
        if !open || !self.change_state(peer, ConnectionState::Disconnecting) {
            return;
        }
        self.drive_disconnecting(peer);
    }

    fn drive_timers(&mut self) {
        for peer in self.registry.peer_ids() {
            let Some(state) = self.registry.get(&peer).map(|c| c.state()) else {
                continue;
            };
            match state {
                ConnectionState::Connecting if self.role == Role::Client => {
                    self.drive_connecting(peer)
                }
                ConnectionState::Connected => self.drive_connected(peer),
                ConnectionState::Disconnecting => self.drive_disconnecting(peer),
                _ => {}
            }
        }
    }

    fn drive_connecting(&mut self, peer: PeerId) {
        let now = self.now;
        let Some(conn) = self.registry.get_mut(&peer) else {
            return;
        };
        if !conn.control_due(now, self.config.handshake_interval()) {
            return;
        }
        if conn.control_attempts >= self.config.handshake_attempts {
            tracing::warn!(peer = %peer, addr = %conn.endpoint(), "Handshake timed out");
            self.change_state(peer, ConnectionState::Disconnected);
            return;
        }
        conn.record_control_sent(now);
        let connect = Control::Connect { nonce: conn.nonce() };
        let endpoint = conn.endpoint();
        self.io.send_control(endpoint, &connect);
    }

    fn drive_connected(&mut self, peer: PeerId) {
        let now = self.now;
        let Some(conn) = self.registry.get_mut(&peer) else {
            return;
        };
        let endpoint = conn.endpoint();

        if now.saturating_duration_since(conn.last_received) >= self.config.idle_timeout() {
            tracing::warn!(peer = %peer, addr = %endpoint, "Peer idle, disconnecting");
            self.teardown_local(peer);
            return;
        }

        let resend = match conn.sender.poll_retransmit(now) {
            Ok(resend) => resend,
            Err(e) => {
                tracing::warn!(peer = %peer, addr = %endpoint, error = %e, "Peer unreachable, disconnecting");
                self.teardown_local(peer);
                return;
            }
        };
        self.io.stats.retransmissions += resend.len() as u64;
        let fresh = conn.sender.poll_transmit(now);
        if !resend.is_empty() || !fresh.is_empty() {
            conn.mark_sent(now);
        }
        for datagram in resend.iter().chain(fresh.iter()) {
            self.io.send(endpoint, datagram);
        }

        if now.saturating_duration_since(conn.last_sent) >= self.config.heartbeat_interval() {
            conn.mark_sent(now);
            self.io.send_control(endpoint, &Control::Heartbeat);
        }
    }

    fn drive_disconnecting(&mut self, peer: PeerId) {
        let now = self.now;
        let Some(conn) = self.registry.get_mut(&peer) else {
            return;
        };
        let started = conn.teardown_started.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.config.disconnect_grace() {
            tracing::debug!(peer = %peer, "Disconnect grace elapsed");
            self.change_state(peer, ConnectionState::Disconnected);
            return;
        }
        if conn.control_due(now, self.config.handshake_interval()) {
            conn.record_control_sent(now);
            let endpoint = conn.endpoint();
            self.io.send_control(endpoint, &Control::Disconnect);
        }
    }

    fn send_message(
        &mut self,
        peer: PeerId,
        message_id: i64,
        rpc: Option<RpcHeader>,
        payload: &[u8],
        reliable: bool,
    ) {
        if payload.len() > self.config.max_payload_len {
            self.io.stats.dropped_sends += 1;
            tracing::warn!(peer = %peer, len = payload.len(), "Payload too large, dropped");
            return;
        }
        let Some(conn) = self
            .registry
            .get_mut(&peer)
            .filter(|c| c.state() == ConnectionState::Connected)
        else {
            self.io.stats.dropped_sends += 1;
            tracing::debug!(peer = %peer, "Send to unconnected peer dropped");
            return;
        };
        let endpoint = conn.endpoint();
        if reliable {
            match rpc {
                Some(header) => conn.sender.enqueue_rpc(message_id, header, payload.to_vec()),
                None => conn.sender.enqueue(message_id, payload.to_vec()),
            }
            let fresh = conn.sender.poll_transmit(self.now);
            if !fresh.is_empty() {
                conn.mark_sent(self.now);
            }
            for datagram in fresh {
                self.io.send(endpoint, &datagram);
            }
        } else {
            let encoded = match rpc {
                Some(header) => wire::encode_rpc(message_id, None, header, payload),
                None => wire::encode_data(message_id, None, payload),
            };
            match encoded {
                Ok(datagram) => {
                    conn.mark_sent(self.now);
                    self.io.send(endpoint, &datagram);
                }
                Err(e) => {
                    self.io.stats.dropped_sends += 1;
                    tracing::warn!(peer = %peer, error = %e, "Failed to encode message");
                }
            }
        }
    }

    fn broadcast_message(
        &mut self,
        message_id: i64,
        rpc: Option<RpcHeader>,
        payload: &[u8],
        reliable: bool,
    ) {
        let connected: Vec<PeerId> = self
            .registry
            .iter()
            .filter(|c| c.state() == ConnectionState::Connected)
            .map(|c| c.peer_id())
            .collect();
        for peer in connected {
            self.send_message(peer, message_id, rpc, payload, reliable);
        }
    }
}

impl<T: Transport> Outbox for Core<T> {
    fn send(&mut self, peer: PeerId, message_id: i64, payload: &[u8]) {
        self.send_message(peer, message_id, None, payload, false);
    }

    fn send_reliable(&mut self, peer: PeerId, message_id: i64, payload: &[u8]) {
        self.send_message(peer, message_id, None, payload, true);
    }

    fn broadcast(&mut self, message_id: i64, payload: &[u8]) {
        self.broadcast_message(message_id, None, payload, false);
    }

    fn broadcast_reliable(&mut self, message_id: i64, payload: &[u8]) {
        self.broadcast_message(message_id, None, payload, true);
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.teardown_local(peer);
    }

    fn call_rpc(
        &mut self,
        peer: PeerId,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    ) {
        let header = RpcHeader {
            request_id,
            arg_type,
        };
        self.send_message(peer, method_id, Some(header), arg_data, reliable);
    }

    fn call_rpc_broadcast(
        &mut self,
        reliable: bool,
        method_id: i64,
        request_id: u64,
        arg_type: i64,
        arg_data: &[u8],
    ) {
        let header = RpcHeader {
            request_id,
            arg_type,
        };
        self.broadcast_message(method_id, Some(header), arg_data, reliable);
    }
}

/// The pump plus the listener. `Server` and `Client` wrap this with their role-specific API.
pub(crate) struct Engine<T: Transport> {
    listener: Box<dyn Listener + Send>,
    core: Core<T>,
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(role: Role, config: EngineConfig, transport: T) -> Result<Self, InitError> {
        config.validate()?;
        let local = transport.local_addr()?;
        tracing::info!(?role, addr = %local, "Engine started");
        // A client gives up on a handshake after this long, so later copies cannot matter.
        let handshake_lifetime = config
            .handshake_interval()
            .saturating_mul(config.handshake_attempts.saturating_add(1));
        Ok(Self {
            listener: Box::new(DefaultListener),
            core: Core {
                role,
                config,
                io: Io {
                    transport: Some(transport),
                    v6_socket: local.is_ipv6(),
                    stats: Stats::default(),
                },
                registry: Registry::new(),
                rejected: RejectedHandshakes::new(REJECTED_HANDSHAKES, handshake_lifetime),
                events: VecDeque::new(),
                recv_buf: vec![0u8; RECV_BUF_LEN],
                now: Instant::now(),
                wall_clock: false,
            },
        })
    }

    pub(crate) fn set_listener(&mut self, listener: Box<dyn Listener + Send>) {
        self.listener = listener;
    }

    /// Pump against the system clock.
    pub(crate) fn process(&mut self) {
        self.core.wall_clock = true;
        self.pump(Instant::now());
    }

    /// Pump against a caller-supplied clock. Sends between pumps reuse `now`.
    pub(crate) fn process_at(&mut self, now: Instant) {
        self.core.wall_clock = false;
        self.pump(now);
    }

    fn pump(&mut self, now: Instant) {
        if self.core.io.transport.is_none() {
            return;
        }
        self.core.now = now;
        self.core.receive_batch(&mut *self.listener);
        self.core.drive_timers();
        self.dispatch();
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.core.events.pop_front() {
            match event {
                Event::StateChanged {
                    peer,
                    endpoint,
                    state,
                } => self
                    .listener
                    .on_state_changed(&mut self.core, peer, endpoint, state),
                Event::Message {
                    peer,
                    endpoint,
                    message_id,
                    payload,
                } => self.listener.on_message(
                    &mut self.core,
                    peer,
                    endpoint,
                    message_id,
                    payload,
                ),
                Event::Rpc {
                    peer,
                    endpoint,
                    call,
                } => self.listener.on_rpc(&mut self.core, peer, endpoint, call),
            }
        }
    }

    /// Sending surface for calls made between pumps.
    pub(crate) fn outbox(&mut self) -> &mut dyn Outbox {
        self.sync_clock();
        &mut self.core
    }

    pub(crate) fn open(&mut self, server: Endpoint) -> PeerId {
        self.sync_clock();
        self.core.open(server)
    }

    fn sync_clock(&mut self) {
        if self.core.wall_clock {
            self.core.now = self.core.now.max(Instant::now());
        }
    }

    pub(crate) fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.core.registry.get(peer).map(|c| c.state())
    }

    pub(crate) fn connection_info(&self, peer: &PeerId) -> Option<ConnectionInfo> {
        self.core.registry.get(peer).map(|c| c.info())
    }

    pub(crate) fn connected_peers(&self) -> Vec<(PeerId, Endpoint)> {
        self.core
            .registry
            .iter()
            .filter(|c| c.state() == ConnectionState::Connected)
            .map(|c| (c.peer_id(), c.endpoint()))
            .collect()
    }

    pub(crate) fn stats(&self) -> Stats {
        self.core.io.stats
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .io
            .transport
            .as_ref()
            .and_then(|t| t.local_addr().ok())
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.core.io.transport.is_none()
    }

    /// Best-effort Disconnect to every peer, then drop all connections and the socket.
    pub(crate) fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        let core = &mut self.core;
        for conn in core.registry.iter() {
            if conn.state() != ConnectionState::Disconnected {
                core.io.send_control(conn.endpoint(), &Control::Disconnect);
            }
        }
        core.registry.clear();
        core.rejected.clear();
        core.events.clear();
        core.io.transport = None;
        tracing::info!(role = ?core.role, "Engine destroyed");
    }
}

impl<T: Transport> Drop for Engine<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FaultConfig, SimNetwork};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        states: Vec<(PeerId, ConnectionState)>,
        messages: Vec<(i64, Vec<u8>)>,
        requests: usize,
    }

    struct Recorder {
        log: Arc<Mutex<Recorded>>,
        accept: bool,
    }

    impl Listener for Recorder {
        fn on_connection_request(&mut self, _endpoint: &Endpoint) -> bool {
            self.log.lock().unwrap().requests += 1;
            self.accept
        }

        fn on_state_changed(
            &mut self,
            _out: &mut dyn Outbox,
            peer: PeerId,
            _endpoint: Endpoint,
            state: ConnectionState,
        ) {
            self.log.lock().unwrap().states.push((peer, state));
        }

        fn on_message(
            &mut self,
            _out: &mut dyn Outbox,
            _peer: PeerId,
            _endpoint: Endpoint,
            message_id: i64,
            payload: Vec<u8>,
        ) {
            self.log.lock().unwrap().messages.push((message_id, payload));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn recorder(accept: bool) -> (Box<Recorder>, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        (
            Box::new(Recorder {
                log: log.clone(),
                accept,
            }),
            log,
        )
    }

    #[test]
    fn address_literals_resolve_without_lookup() {
        assert_eq!(
            resolve_address("127.0.0.1", 55655).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 55655))
        );
        assert!(resolve_address("::1", 80).unwrap().is_ipv6());
        assert!(matches!(
            resolve_address("", 80),
            Err(InitError::InvalidAddress(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        let result = Engine::new(Role::Server, config, net.bind(addr(1)).unwrap());
        assert!(matches!(result, Err(InitError::Config(_))));
    }

    #[test]
    fn malformed_and_unknown_datagrams_are_counted() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut server =
            Engine::new(Role::Server, EngineConfig::default(), net.bind(addr(1)).unwrap()).unwrap();
        let mut raw = net.bind(addr(2)).unwrap();
        raw.send_to(&[0xde, 0xad], addr(1)).unwrap();
        raw.send_to(&wire::encode_data(5, None, b"x").unwrap(), addr(1))
            .unwrap();
        raw.send_to(&wire::encode_control(&Control::Heartbeat).unwrap(), addr(1))
            .unwrap();
        let mut padded = wire::encode_control(&Control::Disconnect).unwrap();
        padded.push(0);
        raw.send_to(&padded, addr(1)).unwrap();
        server.process_at(Instant::now());
        let stats = server.stats();
        assert_eq!(stats.datagrams_in, 4);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.unknown_peer, 2);
        assert!(server.connected_peers().is_empty());
    }

    #[test]
    fn stateless_disconnect_ack_for_unknown_endpoint() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut server =
            Engine::new(Role::Server, EngineConfig::default(), net.bind(addr(1)).unwrap()).unwrap();
        let mut raw = net.bind(addr(2)).unwrap();
        raw.send_to(&wire::encode_control(&Control::Disconnect).unwrap(), addr(1))
            .unwrap();
        server.process_at(Instant::now());
        let mut buf = [0u8; 64];
        let (n, from) = raw.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(
            wire::decode_frame(&buf[..n]).unwrap(),
            Frame::Control(Control::DisconnectAck)
        );
    }

    #[test]
    fn batch_size_bounds_one_pump() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let config = EngineConfig {
            batch_size: 2,
            ..EngineConfig::default()
        };
        let mut server = Engine::new(Role::Server, config, net.bind(addr(1)).unwrap()).unwrap();
        let mut raw = net.bind(addr(2)).unwrap();
        for _ in 0..5 {
            raw.send_to(&[0], addr(1)).unwrap();
        }
        let now = Instant::now();
        server.process_at(now);
        assert_eq!(server.stats().datagrams_in, 2);
        assert_eq!(net.pending(addr(1)), 3);
        server.process_at(now);
        server.process_at(now);
        assert_eq!(server.stats().datagrams_in, 5);
    }

    #[test]
    fn handshake_and_reliable_exchange() {
        let net = SimNetwork::new(9, FaultConfig::lossless());
        let config = EngineConfig::default();
        let mut server =
            Engine::new(Role::Server, config.clone(), net.bind(addr(1)).unwrap()).unwrap();
        let mut client = Engine::new(Role::Client, config, net.bind(addr(2)).unwrap()).unwrap();
        let (server_listener, server_log) = recorder(true);
        let (client_listener, client_log) = recorder(true);
        server.set_listener(server_listener);
        client.set_listener(client_listener);

        let mut now = Instant::now();
        let server_peer = client.open(Endpoint::from(addr(1)));
        for _ in 0..4 {
            server.process_at(now);
            client.process_at(now);
            now += Duration::from_millis(5);
        }
        assert_eq!(client.connection_state(&server_peer), Some(ConnectionState::Connected));
        let clients = server.connected_peers();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].1, Endpoint::from(addr(2)));

        client.outbox().send_reliable(server_peer, 888, b"hello");
        for _ in 0..4 {
            server.process_at(now);
            client.process_at(now);
            now += Duration::from_millis(5);
        }
        assert_eq!(server_log.lock().unwrap().messages, vec![(888, b"hello".to_vec())]);
        assert_eq!(server_log.lock().unwrap().requests, 1);
        let states: Vec<_> = server_log.lock().unwrap().states.iter().map(|s| s.1).collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        let states: Vec<_> = client_log.lock().unwrap().states.iter().map(|s| s.1).collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        let info = client.connection_info(&server_peer).unwrap();
        assert_eq!(info.in_flight, 0);
        assert!(info.srtt.is_some());
    }

    #[test]
    fn destroy_is_idempotent_and_notifies_peers() {
        let net = SimNetwork::new(2, FaultConfig::lossless());
        let mut server =
            Engine::new(Role::Server, EngineConfig::default(), net.bind(addr(1)).unwrap()).unwrap();
        let mut client =
            Engine::new(Role::Client, EngineConfig::default(), net.bind(addr(2)).unwrap()).unwrap();
        let now = Instant::now();
        let server_peer = client.open(Endpoint::from(addr(1)));
        server.process_at(now);
        client.process_at(now);
        assert_eq!(server.connected_peers().len(), 1);

        client.destroy();
        client.destroy();
        assert!(client.is_destroyed());
        assert_eq!(client.local_addr(), None);
        assert_eq!(client.connection_state(&server_peer), None);
        client.outbox().send(server_peer, 1, b"late");

        server.process_at(now);
        assert!(server.connected_peers().is_empty());
    }

    fn replies(raw: &mut crate::simulator::SimTransport) -> Vec<Control> {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Some((n, _)) = raw.recv_from(&mut buf).unwrap() {
            if let Ok(Frame::Control(control)) = wire::decode_frame(&buf[..n]) {
                out.push(control);
            }
        }
        out
    }

    #[test]
    fn repeated_refused_handshake_is_decided_once() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let config = EngineConfig::default();
        let lifetime = config.handshake_interval() * (config.handshake_attempts + 1);
        let mut server = Engine::new(Role::Server, config, net.bind(addr(1)).unwrap()).unwrap();
        let (listener, log) = recorder(false);
        server.set_listener(listener);
        let mut raw = net.bind(addr(2)).unwrap();
        let connect = wire::encode_control(&Control::Connect { nonce: 7 }).unwrap();

        raw.send_to(&connect, addr(1)).unwrap();
        raw.send_to(&connect, addr(1)).unwrap();
        let now = Instant::now();
        server.process_at(now);
        assert_eq!(log.lock().unwrap().requests, 1);
        assert_eq!(server.stats().rejected, 1);
        assert_eq!(
            replies(&mut raw),
            vec![Control::Reject { nonce: 7 }, Control::Reject { nonce: 7 }]
        );

        // a late copy still gets its answer without a new decision
        raw.send_to(&connect, addr(1)).unwrap();
        server.process_at(now + Duration::from_secs(1));
        assert_eq!(log.lock().unwrap().requests, 1);
        assert_eq!(replies(&mut raw), vec![Control::Reject { nonce: 7 }]);

        // a new handshake from the same endpoint is a new decision
        raw.send_to(&wire::encode_control(&Control::Connect { nonce: 8 }).unwrap(), addr(1))
            .unwrap();
        server.process_at(now + Duration::from_secs(1));
        assert_eq!(log.lock().unwrap().requests, 2);
        assert!(server.connected_peers().is_empty());
        assert!(log.lock().unwrap().states.is_empty());

        // the memory is bounded in time
        raw.send_to(&connect, addr(1)).unwrap();
        server.process_at(now + lifetime + Duration::from_millis(1));
        assert_eq!(log.lock().unwrap().requests, 3);
        assert_eq!(server.stats().rejected, 3);
    }

    #[test]
    fn sends_between_wall_clock_pumps_are_stamped_when_sent() {
        let net = SimNetwork::new(4, FaultConfig::lossless());
        let config = EngineConfig {
            initial_rto_ms: 50,
            min_rto_ms: 50,
            ..EngineConfig::default()
        };
        let mut server =
            Engine::new(Role::Server, config.clone(), net.bind(addr(1)).unwrap()).unwrap();
        let mut client = Engine::new(Role::Client, config, net.bind(addr(2)).unwrap()).unwrap();
        let server_peer = client.open(Endpoint::from(addr(1)));
        for _ in 0..3 {
            server.process();
            client.process();
        }
        assert_eq!(client.connection_state(&server_peer), Some(ConnectionState::Connected));

        // longer than the retransmit timeout without a pump
        std::thread::sleep(Duration::from_millis(150));
        client.outbox().send_reliable(server_peer, 1, b"late");
        client.process();
        assert_eq!(client.stats().retransmissions, 0);

        server.process();
        client.process();
        let info = client.connection_info(&server_peer).unwrap();
        assert_eq!(info.in_flight, 0);
        assert!(info.srtt.unwrap() < Duration::from_millis(150));
    }
}
