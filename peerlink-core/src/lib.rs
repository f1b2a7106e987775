//! PeerLink messaging engine: client/server messaging over UDP with reliable
//! (ordered, exactly-once) and unreliable delivery plus connection admission.
//! Host-driven: no threads or timers; the host calls `process()` and callbacks fire inside it.

pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod reliability;
pub mod server;
pub mod simulator;
pub mod transport;
pub mod wire;

pub use client::{Client, ConnectError};
pub use config::{ConfigError, EngineConfig};
pub use connection::{ConnectionInfo, ConnectionState};
pub use engine::{DefaultListener, InitError, Listener, Outbox, Stats};
pub use identity::{Endpoint, PeerId};
pub use protocol::{RpcCall, PROTOCOL_VERSION};
pub use server::Server;
pub use transport::{Transport, UdpTransport};
pub use wire::{
    decode_frame, encode_control, encode_data, encode_rpc, FrameDecodeError, FrameEncodeError,
    RpcHeader,
};
