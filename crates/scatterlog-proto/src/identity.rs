//! Publisher identity and numbering.

use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

/// Key rotation generation chosen by a publisher.
pub type Epoch = u32;

/// Per-(source, epoch) packet counter. Starts at 1.
pub type Sequence = u32;

/// Stable identifier of one logical publisher process.
///
/// `endpoint` is where the publisher's key listener answers requests;
/// `instance_id` is a random value picked at process start so that a restarted
/// publisher on the same address never collides with its previous
/// incarnation's epochs and sequence numbers.
///
/// The multicast group a publisher was heard on is not part of the identity
/// on the wire. Receivers record it alongside the identity in their source
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Key listener endpoint of the publisher
    pub endpoint: SocketAddr,
    /// Random per-process instance identifier
    pub instance_id: u64,
}

impl SourceIdentity {
    /// Size of [`SourceIdentity::canonical_bytes`].
    pub const CANONICAL_SIZE: usize = 26;

    /// Create an identity.
    pub fn new(endpoint: SocketAddr, instance_id: u64) -> Self {
        Self { endpoint, instance_id }
    }

    /// Address bytes as they appear on the wire (IPv4 is mapped into IPv6).
    pub fn address_octets(&self) -> [u8; 16] {
        match self.endpoint.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Fixed 26-byte encoding: address, port, instance id.
    ///
    /// Same fields and order as the packet header. Credentials and grants are
    /// bound to these bytes.
    pub fn canonical_bytes(&self) -> [u8; Self::CANONICAL_SIZE] {
        let mut out = [0u8; Self::CANONICAL_SIZE];
        out[..16].copy_from_slice(&self.address_octets());
        out[16..18].copy_from_slice(&self.endpoint.port().to_be_bytes());
        out[18..].copy_from_slice(&self.instance_id.to_be_bytes());
        out
    }

    /// Rebuild an identity from wire fields.
    ///
    /// IPv4-mapped addresses are folded back to IPv4 so identities compare
    /// equal to the ones senders constructed.
    pub fn from_wire(address: [u8; 16], port: u16, instance_id: u64) -> Self {
        let v6 = Ipv6Addr::from(address);
        let ip = v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4);
        Self { endpoint: SocketAddr::new(ip, port), instance_id }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.endpoint, self.instance_id)
    }
}
