//! Fixed-layout message packet header.
//!
//! ```text
//!  0        1        2                4
//!  +--------+--------+----------------+
//!  |version | flags  |  source port   |
//!  +--------+--------+----------------+
//!  |                                  |
//!  |   source address (16, IPv6 or    |
//!  |   IPv4-mapped)                   |
//!  |                                  |
//!  +----------------------------------+ 20
//!  |   instance id (8)                |
//!  +----------------------------------+ 28
//!  |   epoch (4)                      |
//!  +----------------------------------+ 32
//!  |   sequence (4)                   |
//!  +----------------------------------+ 36
//!  |   payload length (4)             |
//!  +----------------------------------+ 40
//! ```
//!
//! All multi-byte fields are big-endian. The whole header is fed to the AEAD
//! as associated data, so any tampering surfaces as an authentication failure.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::network_endian::{U16, U32, U64},
};

use crate::{Epoch, FrameError, PacketFlags, Sequence, SourceIdentity};

/// Packet header, 40 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    version: u8,
    flags: u8,
    port: U16,
    address: [u8; 16],
    instance_id: U64,
    epoch: U32,
    sequence: U32,
    payload_len: U32,
}

const _: () = assert!(size_of::<PacketHeader>() == PacketHeader::SIZE);

impl PacketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 40;

    /// Protocol version written by this implementation.
    pub const VERSION: u8 = 1;

    /// Build a header for an outgoing packet.
    pub fn new(
        source: &SourceIdentity,
        epoch: Epoch,
        sequence: Sequence,
        flags: PacketFlags,
        payload_len: u32,
    ) -> Self {
        Self {
            version: Self::VERSION,
            flags: flags.bits(),
            port: U16::new(source.endpoint.port()),
            address: source.address_octets(),
            instance_id: U64::new(source.instance_id),
            epoch: U32::new(epoch),
            sequence: U32::new(sequence),
            payload_len: U32::new(payload_len),
        }
    }

    /// Parse the header from the start of `bytes`.
    ///
    /// Only checks that enough bytes are present. Version and length checks
    /// belong to [`crate::MessagePacket::decode`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::read_from_prefix(bytes)
            .map(|(header, _rest)| header)
            .map_err(|_| FrameError::TooShort { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Header as wire bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Protocol version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Header flags. Unknown bits are retained.
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_retain(self.flags)
    }

    /// Publisher identity.
    pub fn source(&self) -> SourceIdentity {
        SourceIdentity::from_wire(self.address, self.port.get(), self.instance_id.get())
    }

    /// Key epoch the payload is encrypted under.
    pub fn epoch(&self) -> Epoch {
        self.epoch.get()
    }

    /// Sequence number within the epoch.
    pub fn sequence(&self) -> Sequence {
        self.sequence.get()
    }

    /// Declared ciphertext length, excluding the tag.
    pub fn payload_len(&self) -> u32 {
        self.payload_len.get()
    }

    /// Instance id of the publisher.
    pub fn instance_id(&self) -> u64 {
        self.instance_id.get()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn source() -> SourceIdentity {
        SourceIdentity::new(SocketAddr::from((Ipv4Addr::new(192, 168, 1, 20), 7400)), 0x0102_0304_0506_0708)
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let header = PacketHeader::new(&source(), 3, 9, PacketFlags::EPOCH_START, 0x20);

        insta::assert_snapshot!(
            hex::encode(header.to_bytes()),
            @"01011ce800000000000000000000ffffc0a801140102030405060708000000030000000900000020"
        );
    }

    #[test]
    fn header_fields_round_trip() {
        let header = PacketHeader::new(&source(), 7, 11, PacketFlags::empty(), 128);
        let parsed = PacketHeader::from_bytes(&header.to_bytes()).unwrap();

        assert_eq!(parsed.version(), PacketHeader::VERSION);
        assert_eq!(parsed.source(), source());
        assert_eq!(parsed.epoch(), 7);
        assert_eq!(parsed.sequence(), 11);
        assert_eq!(parsed.payload_len(), 128);
        assert!(!parsed.flags().is_epoch_start());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let result = PacketHeader::from_bytes(&[1u8; PacketHeader::SIZE - 1]);
        assert_eq!(result, Err(FrameError::TooShort { expected: 40, actual: 39 }));
    }

    #[test]
    fn unknown_flag_bits_are_retained() {
        let mut bytes = PacketHeader::new(&source(), 1, 1, PacketFlags::empty(), 0).to_bytes();
        bytes[1] = 0b1000_0001;
        let parsed = PacketHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.flags().is_epoch_start());
        assert_eq!(parsed.flags().bits(), 0b1000_0001);
    }
}
