//! Error types for wire parsing.

use thiserror::Error;

/// Defect found while framing or parsing a message packet.
///
/// Always fatal to the packet it describes. A receiver drops the datagram and
/// moves on; nothing is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer is shorter than the fixed header plus authentication tag.
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Header carries a protocol version this implementation does not speak.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Declared payload length disagrees with the bytes that arrived.
    #[error("payload length mismatch: header declares {declared} bytes, datagram holds {actual}")]
    LengthMismatch {
        /// Payload length from the header
        declared: usize,
        /// Payload bytes present after the header (excluding the tag)
        actual: usize,
    },

    /// Declared payload is larger than any datagram can carry.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload size
        size: usize,
        /// Maximum permitted payload size
        max: usize,
    },
}

/// Defect found while encoding or decoding a CBOR body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// CBOR serialization failed.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// Body exceeds the size limit for its datagram kind.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Body size in bytes
        size: usize,
        /// Maximum permitted size
        max: usize,
    },

    /// Key exchange prefix is too short.
    #[error("key exchange datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Key exchange prefix does not start with the protocol magic.
    #[error("bad key exchange magic {0:#06x}")]
    BadMagic(u16),

    /// Key exchange prefix carries an unsupported version.
    #[error("unsupported key exchange version {0}")]
    BadVersion(u8),

    /// Key exchange prefix carries an unknown datagram kind.
    #[error("unknown key exchange kind {0}")]
    UnknownKind(u8),
}
