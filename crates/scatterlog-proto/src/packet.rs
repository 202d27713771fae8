//! Message packet: header, ciphertext and authentication tag.

use bytes::Bytes;

use crate::{Epoch, FrameError, PacketFlags, PacketHeader, Sequence, SourceIdentity};

/// Authentication tag size. Every supported cipher suite produces 16 bytes.
pub const TAG_SIZE: usize = 16;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest ciphertext that fits in one datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - PacketHeader::SIZE - TAG_SIZE;

/// One framed message packet.
///
/// Constructed by the sender per outgoing message and dropped after
/// transmission; constructed by the receiver from raw bytes and dropped after
/// decryption or discard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePacket {
    header: PacketHeader,
    ciphertext: Bytes,
    tag: [u8; TAG_SIZE],
}

impl MessagePacket {
    /// Smallest valid datagram: header plus tag, empty ciphertext.
    pub const MIN_SIZE: usize = PacketHeader::SIZE + TAG_SIZE;

    /// Assemble a packet from its parts.
    ///
    /// Fails if the header's payload length does not describe `ciphertext`.
    pub fn new(
        header: PacketHeader,
        ciphertext: impl Into<Bytes>,
        tag: [u8; TAG_SIZE],
    ) -> Result<Self, FrameError> {
        let ciphertext = ciphertext.into();
        if ciphertext.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: ciphertext.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if header.payload_len() as usize != ciphertext.len() {
            return Err(FrameError::LengthMismatch {
                declared: header.payload_len() as usize,
                actual: ciphertext.len(),
            });
        }
        Ok(Self { header, ciphertext, tag })
    }

    /// Parse a received datagram.
    ///
    /// The datagram must hold exactly one packet; trailing bytes are a length
    /// mismatch rather than being ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        if datagram.len() < Self::MIN_SIZE {
            return Err(FrameError::TooShort { expected: Self::MIN_SIZE, actual: datagram.len() });
        }

        let header = PacketHeader::from_bytes(datagram)?;
        if header.version() != PacketHeader::VERSION {
            return Err(FrameError::BadVersion(header.version()));
        }

        let declared = header.payload_len() as usize;
        if declared > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { size: declared, max: MAX_PAYLOAD_SIZE });
        }

        let actual = datagram.len() - Self::MIN_SIZE;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let (body, tag_bytes) = datagram[PacketHeader::SIZE..].split_at(declared);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(tag_bytes);

        Ok(Self { header, ciphertext: Bytes::copy_from_slice(body), tag })
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.reserve(self.encoded_len());
        dst.extend_from_slice(&self.header.to_bytes());
        dst.extend_from_slice(&self.ciphertext);
        dst.extend_from_slice(&self.tag);
    }

    /// Wire encoding as a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Size of the wire encoding.
    pub fn encoded_len(&self) -> usize {
        Self::MIN_SIZE + self.ciphertext.len()
    }

    /// Packet header.
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Encrypted payload.
    pub fn ciphertext(&self) -> &Bytes {
        &self.ciphertext
    }

    /// Authentication tag.
    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Publisher identity from the header.
    pub fn source(&self) -> SourceIdentity {
        self.header.source()
    }

    /// Key epoch from the header.
    pub fn epoch(&self) -> Epoch {
        self.header.epoch()
    }

    /// Sequence number from the header.
    pub fn sequence(&self) -> Sequence {
        self.header.sequence()
    }

    /// Header flags.
    pub fn flags(&self) -> PacketFlags {
        self.header.flags()
    }
}
