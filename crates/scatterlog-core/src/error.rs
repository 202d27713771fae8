//! Error and discard taxonomy.
//!
//! Nothing here is fatal to the process. Codec and crypto failures are fatal
//! to the one packet or reply they describe; [`DiscardReason`] is how the
//! receiver reports that a packet went nowhere.

use scatterlog_crypto::CryptoError;
use scatterlog_proto::{Epoch, FrameError, PayloadError};
use thiserror::Error;

use crate::requester::{FailureReason, RequesterState};

/// Sealing or opening a message packet failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Malformed or oversized frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Plaintext could not be encoded or decoded
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// AEAD failure, including authentication
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl CodecError {
    /// Whether this is a failed authentication tag check.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::AuthenticationFailed))
    }
}

/// Publishing or rotating failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Every sequence number of this epoch has been used; rotate first
    #[error("sequence numbers exhausted for epoch {epoch}")]
    SequenceExhausted {
        /// Exhausted epoch
        epoch: Epoch,
    },

    /// Rotation must move to a strictly higher epoch
    #[error("epoch must advance: current {current}, requested {requested}")]
    EpochNotAdvanced {
        /// Current epoch
        current: Epoch,
        /// Rejected epoch
        requested: Epoch,
    },

    /// Sealing the packet failed
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Key listener failed to handle a datagram or install a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    /// Datagram is not a well-formed key exchange message
    #[error("malformed key exchange: {0}")]
    Payload(#[from] PayloadError),

    /// A reply arrived on the request port
    #[error("unexpected reply on listener socket")]
    UnexpectedReply,

    /// Grant sealing failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Installed epochs must be strictly increasing
    #[error("epoch must advance: newest {newest}, installing {requested}")]
    EpochNotAdvanced {
        /// Newest installed epoch
        newest: Epoch,
        /// Rejected epoch
        requested: Epoch,
    },
}

/// Key requester misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequesterError {
    /// Operation not valid in the current state
    #[error("invalid state {state:?} for operation {operation}")]
    InvalidState {
        /// State at the time of the call
        state: RequesterState,
        /// Rejected operation
        operation: String,
    },
}

/// Why a received packet was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscardReason {
    /// Bytes did not frame
    #[error("malformed packet: {0}")]
    Malformed(FrameError),

    /// Tag check failed. Security relevant.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Authenticated, but the plaintext is not a message
    #[error("undecodable plaintext")]
    Undecodable,

    /// Sequence number already seen in this epoch
    #[error("duplicate sequence")]
    Duplicate,

    /// Sequence or epoch too old to track
    #[error("stale sequence or epoch")]
    Stale,

    /// Key request failed or is negatively cached
    #[error("key unavailable: {0}")]
    KeyUnavailable(FailureReason),

    /// Too many packets already waiting on this key
    #[error("key wait queue full")]
    QueueFull,
}

impl DiscardReason {
    /// Whether the discard should be reported as a security event.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::AuthenticationFailed | Self::KeyUnavailable(FailureReason::AuthRejected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_reasons_render_for_logs() {
        let rendered: Vec<String> = [
            DiscardReason::Malformed(FrameError::BadVersion(9)),
            DiscardReason::AuthenticationFailed,
            DiscardReason::Duplicate,
            DiscardReason::KeyUnavailable(FailureReason::Exhausted { attempts: 5 }),
            DiscardReason::QueueFull,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        insta::assert_debug_snapshot!(rendered, @r#"
        [
            "malformed packet: unsupported protocol version 9",
            "authentication failed",
            "duplicate sequence",
            "key unavailable: no reply after 5 attempts",
            "key wait queue full",
        ]
        "#);
    }

    #[test]
    fn only_forgery_and_refused_credentials_are_security_relevant() {
        assert!(DiscardReason::AuthenticationFailed.is_security_relevant());
        assert!(DiscardReason::KeyUnavailable(FailureReason::AuthRejected).is_security_relevant());
        assert!(!DiscardReason::Duplicate.is_security_relevant());
        assert!(!DiscardReason::KeyUnavailable(FailureReason::UnknownEpoch).is_security_relevant());
    }
}
