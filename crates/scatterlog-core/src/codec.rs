//! Seal and open message packets.
//!
//! Sealing encodes a [`Message`] as CBOR, encrypts it in place under the
//! (source, epoch) key and frames it behind a [`PacketHeader`]. The full
//! header is the AEAD associated data and the nonce is derived from it, so
//! a receiver that authenticates the payload has also authenticated every
//! header field.
//!
//! Nothing here keeps state. Sequence numbering belongs to
//! [`crate::sender::Sender`], duplicate suppression to
//! [`crate::sequence::SequenceWindow`].

use scatterlog_crypto::{CipherSuite, KeyMaterial, PacketNonce};
use scatterlog_proto::{
    Epoch, FrameError, MAX_PAYLOAD_SIZE, Message, MessagePacket, PacketFlags, PacketHeader,
    Sequence, SourceIdentity,
};

use crate::CodecError;

/// Everything the receiver learns from a successfully opened packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    /// Publisher
    pub source: SourceIdentity,
    /// Key epoch
    pub epoch: Epoch,
    /// Sequence within the epoch
    pub sequence: Sequence,
    /// Header flags
    pub flags: PacketFlags,
    /// Decrypted message
    pub message: Message,
}

/// Encrypt and frame one message.
pub fn seal(
    message: &Message,
    source: &SourceIdentity,
    key: &KeyMaterial,
    epoch: Epoch,
    sequence: Sequence,
    flags: PacketFlags,
    suite: &dyn CipherSuite,
) -> Result<MessagePacket, CodecError> {
    let mut buffer = message.to_cbor()?;
    if buffer.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { size: buffer.len(), max: MAX_PAYLOAD_SIZE }.into());
    }

    // Bounded by MAX_PAYLOAD_SIZE above.
    #[allow(clippy::cast_possible_truncation)]
    let header = PacketHeader::new(source, epoch, sequence, flags, buffer.len() as u32);
    let nonce = PacketNonce::new(source.instance_id, epoch, sequence);
    let tag = suite.seal(key, &nonce, &header.to_bytes(), &mut buffer)?;

    Ok(MessagePacket::new(header, buffer, tag)?)
}

/// [`seal`] straight to datagram bytes.
pub fn encode(
    message: &Message,
    source: &SourceIdentity,
    key: &KeyMaterial,
    epoch: Epoch,
    sequence: Sequence,
    flags: PacketFlags,
    suite: &dyn CipherSuite,
) -> Result<Vec<u8>, CodecError> {
    seal(message, source, key, epoch, sequence, flags, suite).map(|packet| packet.to_vec())
}

/// Frame a received datagram without decrypting it.
///
/// Yields source, epoch, sequence, ciphertext and tag through the
/// [`MessagePacket`] accessors.
pub fn decode(datagram: &[u8]) -> Result<MessagePacket, FrameError> {
    MessagePacket::decode(datagram)
}

/// Authenticate and decrypt a framed packet.
///
/// A tampered header, ciphertext or tag, or the wrong key, all surface as
/// [`CodecError::Crypto`] with [`scatterlog_crypto::CryptoError::AuthenticationFailed`].
pub fn open(
    packet: &MessagePacket,
    key: &KeyMaterial,
    suite: &dyn CipherSuite,
) -> Result<OpenedPacket, CodecError> {
    let header = packet.header();
    let nonce = PacketNonce::new(header.instance_id(), header.epoch(), header.sequence());

    let mut buffer = packet.ciphertext().to_vec();
    suite.open(key, &nonce, &header.to_bytes(), &mut buffer, packet.tag())?;

    Ok(OpenedPacket {
        source: packet.source(),
        epoch: packet.epoch(),
        sequence: packet.sequence(),
        flags: packet.flags(),
        message: Message::from_cbor(&buffer)?,
    })
}
