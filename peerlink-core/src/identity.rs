//! Peer identity and transport addressing: connection IDs and normalised endpoints.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection identity (UUID v4). Assigned once per admitted connection and never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Fresh random identity. Only the registry hands these out.
    pub(crate) fn generate() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Create a `PeerId` from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport address of a peer: IP normalised to 16 octets (IPv4 as IPv4-mapped IPv6) plus port.
///
/// Normalising keeps `1.2.3.4:80` and `[::ffff:1.2.3.4]:80` the same registry key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    octets: [u8; 16],
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let v6 = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            octets: v6.octets(),
            port,
        }
    }

    pub fn from_octets(octets: [u8; 16], port: u16) -> Self {
        Self { octets, port }
    }

    pub fn octets(&self) -> &[u8; 16] {
        &self.octets
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// IP address, unmapped back to IPv4 when it was stored as IPv4-mapped.
    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.octets);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.socket_addr()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}
