//! Wire format for the Scatterlog secure multicast log transport.
//!
//! Two kinds of datagrams cross the network:
//!
//! - **Message packets** travel over IP multicast. Each is a fixed 40-byte
//!   big-endian header followed by an AEAD ciphertext and a 16-byte tag. The
//!   header carries the publisher identity, key epoch and sequence number so
//!   a receiver can pick the right key and run duplicate suppression without
//!   decrypting anything.
//! - **Key exchange** datagrams travel unicast between a receiver and a
//!   publisher's key listener. A 12-byte prefix carries the correlation nonce
//!   and the body is CBOR.
//!
//! This crate only frames and parses bytes. Encryption lives in
//! `scatterlog-crypto` and the protocol state machines in `scatterlog-core`.
//!
//! # Security
//!
//! All header parsing goes through compile-time verified layouts via
//! `zerocopy`. Length fields are never trusted beyond the buffer they arrived
//! in, and every malformed input is classified by [`FrameError`] or
//! [`PayloadError`] instead of panicking.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod flags;
pub mod header;
pub mod identity;
pub mod message;
pub mod packet;
pub mod payloads;

pub use errors::{FrameError, PayloadError};
pub use flags::PacketFlags;
pub use header::PacketHeader;
pub use identity::{Epoch, Sequence, SourceIdentity};
pub use message::{Facility, Message, Severity};
pub use packet::{MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE, MessagePacket, TAG_SIZE};
pub use payloads::keys::{
    ExchangeKind, KeyExchange, KeyGrant, KeyReply, KeyReplyStatus, KeyRequest, SealedGrant,
    peek_nonce,
};
