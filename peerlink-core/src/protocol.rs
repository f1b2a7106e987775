//! PeerLink wire protocol: version, header flags and control messages.

use serde::{Deserialize, Serialize};

/// Current protocol version. First byte of every datagram.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header flag bits (second byte of every datagram).
pub mod flags {
    /// Data frame carries a sequence number and must be acked.
    pub const RELIABLE: u8 = 0b0000_0001;
    /// Frame body is a bincode-encoded [`super::Control`] message.
    pub const CONTROL: u8 = 0b0000_0010;
    /// Data frame is an RPC call: an RPC header follows the sequence number.
    pub const RPC: u8 = 0b0000_0100;
    /// Every bit this version understands.
    pub const KNOWN: u8 = RELIABLE | CONTROL | RPC;
}

/// Connection control messages. Encoding is bincode; they carry no application message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Client asks to open a connection. The nonce tells a retransmitted request
    /// apart from a new handshake coming from the same address.
    Connect { nonce: u64 },
    /// Server admitted the connection identified by `nonce`.
    Accept { nonce: u64 },
    /// Server refused the connection identified by `nonce`.
    Reject { nonce: u64 },
    /// Reliable data frame with this sequence number arrived.
    Ack { seq: u32 },
    /// Sender is tearing the connection down.
    Disconnect,
    /// Response to `Disconnect`; completes the teardown.
    DisconnectAck,
    /// Keepalive sent on an otherwise idle connection.
    Heartbeat,
}

/// An RPC call as handed to [`crate::Listener::on_rpc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    /// Whether it travelled on the reliable channel.
    pub reliable: bool,
    pub method_id: i64,
    /// Chosen by the caller; lets it match replies to calls.
    pub request_id: u64,
    /// Application tag describing `arg_data`.
    pub arg_type: i64,
    pub arg_data: Vec<u8>,
}
