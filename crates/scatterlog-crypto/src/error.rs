//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from sealing, opening and key handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    SealFailed,

    /// Authentication tag did not verify (wrong key, tampered data or header)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Sealed blob shorter than its framing
    #[error("sealed data too short: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Validity window ends before it starts
    #[error("invalid validity window: not_before {not_before} > not_after {not_after}")]
    InvalidValidity {
        /// Start of validity, unix seconds
        not_before: u64,
        /// End of validity, unix seconds
        not_after: u64,
    },

    /// Shared secret too short to be useful
    #[error("shared secret too short: need at least {min} bytes, got {actual}")]
    WeakSecret {
        /// Minimum length
        min: usize,
        /// Actual length
        actual: usize,
    },

    /// HKDF expand rejected the requested output length
    #[error("key derivation failed")]
    KeyDerivation,
}
