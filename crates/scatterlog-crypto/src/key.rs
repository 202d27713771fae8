//! Symmetric key material with a validity window.

use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;

/// 256-bit secret. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes, for handing to a cipher or sealing into a grant.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Validity window in unix seconds, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// First second the key may be used
    pub not_before: u64,
    /// Last second the key may be used
    pub not_after: u64,
}

impl Validity {
    /// Window of `lifetime_secs` starting at `start`.
    pub fn starting_at(start: u64, lifetime_secs: u64) -> Self {
        Self { not_before: start, not_after: start.saturating_add(lifetime_secs) }
    }

    /// Whether `now` falls inside the window widened by `skew` on both ends.
    pub fn contains(&self, now: u64, skew: u64) -> bool {
        now.saturating_add(skew) >= self.not_before && !self.is_expired(now, skew)
    }

    /// Whether the window closed more than `skew` seconds before `now`.
    pub fn is_expired(&self, now: u64, skew: u64) -> bool {
        now > self.not_after.saturating_add(skew)
    }
}

/// Key for one (source, epoch).
///
/// Created by the sender on rotation or by the receiver when a grant is
/// opened. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    secret: SecretKey,
    created_at: u64,
    validity: Validity,
}

impl KeyMaterial {
    /// Build key material from its parts.
    ///
    /// # Errors
    ///
    /// `InvalidValidity` if the window ends before it starts.
    pub fn new(
        secret: [u8; KEY_SIZE],
        created_at: u64,
        validity: Validity,
    ) -> Result<Self, CryptoError> {
        if validity.not_before > validity.not_after {
            return Err(CryptoError::InvalidValidity {
                not_before: validity.not_before,
                not_after: validity.not_after,
            });
        }
        Ok(Self { secret: SecretKey::from_bytes(secret), created_at, validity })
    }

    /// Fresh key valid for `lifetime_secs` from `now`.
    ///
    /// `random` must come from a CSPRNG; the caller owns the entropy source so
    /// simulations stay deterministic.
    pub fn generate(random: [u8; KEY_SIZE], now: u64, lifetime_secs: u64) -> Self {
        Self {
            secret: SecretKey::from_bytes(random),
            created_at: now,
            validity: Validity::starting_at(now, lifetime_secs),
        }
    }

    /// The secret.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Creation time, unix seconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Validity window.
    pub fn validity(&self) -> Validity {
        self.validity
    }

    /// Whether the key may be used at `now` given `skew` seconds of tolerance.
    pub fn is_usable_at(&self, now: u64, skew: u64) -> bool {
        self.validity.contains(now, skew)
    }

    /// Whether the key expired more than `skew` seconds before `now`.
    pub fn is_expired(&self, now: u64, skew: u64) -> bool {
        self.validity.is_expired(now, skew)
    }
}
