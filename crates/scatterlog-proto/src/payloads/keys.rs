//! Key exchange datagrams.
//!
//! Receivers that miss a key ask the publisher's key listener for it over
//! unicast. Every datagram starts with a fixed prefix:
//!
//! ```text
//!  0       2       3       4                               12
//!  +-------+-------+-------+-------------------------------+
//!  | magic |version| kind  |            nonce              |
//!  +-------+-------+-------+-------------------------------+
//! ```
//!
//! followed by a CBOR body. The nonce sits in the prefix so the request
//! transport can correlate replies to requests without decoding CBOR.
//!
//! # Protocol Flow
//!
//! 1. Receiver sees a packet for (source, epoch) it has no key for
//! 2. Receiver sends [`KeyRequest`] with a fresh nonce and a credential bound
//!    to (source, epoch, nonce)
//! 3. Listener verifies the credential and replies with the same nonce:
//!    - `Granted`: the key, sealed to the request nonce
//!    - `AuthFailed`: credential rejected (says nothing about the epoch)
//!    - `UnknownEpoch`: epoch outside the listener's retained window
//! 4. Receiver opens the grant, installs the key and decrypts queued packets

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::network_endian::{U16, U64},
};

use super::{from_cbor, to_cbor};
use crate::{Epoch, PayloadError, SourceIdentity};

/// Size of a symmetric key secret carried in a grant.
pub const GRANT_SECRET_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ExchangePrefix {
    magic: U16,
    version: u8,
    kind: u8,
    nonce: U64,
}

/// Kind of key exchange datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Receiver to listener
    Request,
    /// Listener to receiver
    Reply,
}

impl ExchangeKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::Reply => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, PayloadError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            other => Err(PayloadError::UnknownKind(other)),
        }
    }
}

/// Request for the key of one (source, epoch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    /// Publisher whose key is wanted
    pub source: SourceIdentity,
    /// Epoch whose key is wanted
    pub epoch: Epoch,
    /// Requester-chosen correlation nonce
    pub nonce: u64,
    /// Requester authentication bound to (source, epoch, nonce)
    pub credential: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    source: SourceIdentity,
    epoch: Epoch,
    credential: Vec<u8>,
}

/// Listener's answer to a [`KeyRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReply {
    /// Nonce echoed from the request
    pub nonce: u64,
    /// Outcome
    pub status: KeyReplyStatus,
}

/// Outcome carried by a [`KeyReply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyReplyStatus {
    /// Key found and sealed to the request nonce
    Granted(SealedGrant),
    /// Requester credential rejected
    AuthFailed,
    /// Epoch is not (or no longer) served
    UnknownEpoch,
}

/// A [`KeyGrant`] encrypted for one request. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedGrant(pub Vec<u8>);

/// Plaintext key grant, only ever sent sealed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    /// Epoch the key belongs to
    pub epoch: Epoch,
    /// Symmetric key secret, wiped on drop
    pub secret: Zeroizing<[u8; GRANT_SECRET_SIZE]>,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Start of validity, unix seconds
    pub not_before: u64,
    /// End of validity, unix seconds
    pub not_after: u64,
}

impl fmt::Debug for KeyGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGrant")
            .field("epoch", &self.epoch)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl KeyGrant {
    /// CBOR plaintext for sealing. Holds the secret, so it is wiped on drop.
    pub fn to_cbor(&self) -> Result<Zeroizing<Vec<u8>>, PayloadError> {
        to_cbor(self).map(Zeroizing::new)
    }

    /// Parse an opened grant.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, PayloadError> {
        from_cbor(bytes)
    }
}

/// Any key exchange datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExchange {
    /// Receiver to listener
    Request(KeyRequest),
    /// Listener to receiver
    Reply(KeyReply),
}

impl KeyExchange {
    /// Prefix size in bytes.
    pub const PREFIX_SIZE: usize = 12;

    /// Protocol magic ("SK").
    pub const MAGIC: u16 = 0x534B;

    /// Protocol version.
    pub const VERSION: u8 = 1;

    /// Maximum CBOR body size.
    pub const MAX_BODY_SIZE: usize = 4096;

    /// Correlation nonce.
    pub fn nonce(&self) -> u64 {
        match self {
            Self::Request(request) => request.nonce,
            Self::Reply(reply) => reply.nonce,
        }
    }

    /// Datagram kind.
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Request(_) => ExchangeKind::Request,
            Self::Reply(_) => ExchangeKind::Reply,
        }
    }

    /// Encode to a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let body = match self {
            Self::Request(request) => to_cbor(&RequestBody {
                source: request.source,
                epoch: request.epoch,
                credential: request.credential.clone(),
            })?,
            Self::Reply(reply) => to_cbor(&reply.status)?,
        };
        if body.len() > Self::MAX_BODY_SIZE {
            return Err(PayloadError::TooLarge { size: body.len(), max: Self::MAX_BODY_SIZE });
        }

        let prefix = ExchangePrefix {
            magic: U16::new(Self::MAGIC),
            version: Self::VERSION,
            kind: self.kind().to_u8(),
            nonce: U64::new(self.nonce()),
        };

        let mut out = Vec::with_capacity(Self::PREFIX_SIZE + body.len());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, PayloadError> {
        let (kind, nonce, body) = split_prefix(datagram)?;
        if body.len() > Self::MAX_BODY_SIZE {
            return Err(PayloadError::TooLarge { size: body.len(), max: Self::MAX_BODY_SIZE });
        }

        match kind {
            ExchangeKind::Request => {
                let body: RequestBody = from_cbor(body)?;
                Ok(Self::Request(KeyRequest {
                    source: body.source,
                    epoch: body.epoch,
                    nonce,
                    credential: body.credential,
                }))
            },
            ExchangeKind::Reply => {
                let status: KeyReplyStatus = from_cbor(body)?;
                Ok(Self::Reply(KeyReply { nonce, status }))
            },
        }
    }
}

fn split_prefix(datagram: &[u8]) -> Result<(ExchangeKind, u64, &[u8]), PayloadError> {
    let (prefix, body) = ExchangePrefix::read_from_prefix(datagram).map_err(|_| {
        PayloadError::TooShort { expected: KeyExchange::PREFIX_SIZE, actual: datagram.len() }
    })?;

    if prefix.magic.get() != KeyExchange::MAGIC {
        return Err(PayloadError::BadMagic(prefix.magic.get()));
    }
    if prefix.version != KeyExchange::VERSION {
        return Err(PayloadError::BadVersion(prefix.version));
    }
    let kind = ExchangeKind::from_u8(prefix.kind)?;
    Ok((kind, prefix.nonce.get(), body))
}

/// Read kind and nonce from a key exchange datagram without decoding the body.
///
/// Returns `None` for anything that does not carry a valid prefix.
pub fn peek_nonce(datagram: &[u8]) -> Option<(ExchangeKind, u64)> {
    split_prefix(datagram).ok().map(|(kind, nonce, _)| (kind, nonce))
}
