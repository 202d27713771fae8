//! Packet encryption.
//!
//! # Security
//!
//! A nonce must never repeat under one key. Packet nonces are derived from
//! (instance id, epoch, sequence); keys are per (source, epoch) and the
//! sender never reuses a sequence number within an epoch, so uniqueness
//! holds without sending the nonce.

use std::fmt;

use chacha20poly1305::{
    Key, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};

use crate::{CryptoError, KeyMaterial};

/// Authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Nonce size for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// Per-packet AEAD nonce: `instance_id ‖ epoch ‖ sequence ‖ 0⁸`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNonce([u8; NONCE_SIZE]);

impl PacketNonce {
    /// Derive the nonce for one packet.
    pub fn new(instance_id: u64, epoch: u32, sequence: u32) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&instance_id.to_be_bytes());
        bytes[8..12].copy_from_slice(&epoch.to_be_bytes());
        bytes[12..16].copy_from_slice(&sequence.to_be_bytes());
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Authenticated encryption used for packet payloads.
///
/// Encryption is in place with a detached tag so the packet buffer is
/// written once.
pub trait CipherSuite: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Encrypt `buffer` in place, authenticating `aad`. Returns the tag.
    fn seal(
        &self,
        key: &KeyMaterial,
        nonce: &PacketNonce,
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError>;

    /// Verify `tag` over `aad` and `buffer`, then decrypt `buffer` in place.
    ///
    /// On failure the contents of `buffer` are unspecified.
    fn open(
        &self,
        key: &KeyMaterial,
        nonce: &PacketNonce,
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError>;
}

/// XChaCha20-Poly1305. The default suite.
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Suite;

impl XChaCha20Poly1305Suite {
    fn cipher(key: &KeyMaterial) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(key.secret().as_bytes()))
    }
}

impl CipherSuite for XChaCha20Poly1305Suite {
    fn name(&self) -> &'static str {
        "xchacha20poly1305"
    }

    fn seal(
        &self,
        key: &KeyMaterial,
        nonce: &PacketNonce,
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError> {
        let tag = Self::cipher(key)
            .encrypt_in_place_detached(XNonce::from_slice(nonce.as_bytes()), aad, buffer)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn open(
        &self,
        key: &KeyMaterial,
        nonce: &PacketNonce,
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError> {
        Self::cipher(key)
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce.as_bytes()),
                aad,
                buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::KEY_SIZE;

    fn key(byte: u8) -> KeyMaterial {
        KeyMaterial::generate([byte; KEY_SIZE], 0, 3600)
    }

    #[test]
    fn nonce_layout() {
        let nonce = PacketNonce::new(0x0102_0304_0506_0708, 9, 0x0a0b_0c0d);
        assert_eq!(&nonce.as_bytes()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&nonce.as_bytes()[8..12], &[0, 0, 0, 9]);
        assert_eq!(&nonce.as_bytes()[12..16], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&nonce.as_bytes()[16..], &[0; 8]);
    }

    #[test]
    fn distinct_sequences_give_distinct_nonces() {
        assert_ne!(PacketNonce::new(1, 1, 1), PacketNonce::new(1, 1, 2));
        assert_ne!(PacketNonce::new(1, 1, 1), PacketNonce::new(1, 2, 1));
        assert_ne!(PacketNonce::new(1, 1, 1), PacketNonce::new(2, 1, 1));
    }

    #[test]
    fn seal_then_open() {
        let suite = XChaCha20Poly1305Suite;
        let nonce = PacketNonce::new(7, 1, 1);
        let mut buffer = b"kernel: eth0 link up".to_vec();

        let tag = suite.seal(&key(1), &nonce, b"header", &mut buffer).unwrap();
        assert_ne!(buffer, b"kernel: eth0 link up");

        suite.open(&key(1), &nonce, b"header", &mut buffer, &tag).unwrap();
        assert_eq!(buffer, b"kernel: eth0 link up");
    }

    #[test]
    fn wrong_key_fails() {
        let suite = XChaCha20Poly1305Suite;
        let nonce = PacketNonce::new(7, 1, 1);
        let mut buffer = b"secret".to_vec();
        let tag = suite.seal(&key(1), &nonce, b"", &mut buffer).unwrap();

        let result = suite.open(&key(2), &nonce, b"", &mut buffer, &tag);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampered_aad_fails() {
        let suite = XChaCha20Poly1305Suite;
        let nonce = PacketNonce::new(7, 1, 1);
        let mut buffer = b"secret".to_vec();
        let tag = suite.seal(&key(1), &nonce, b"epoch=1", &mut buffer).unwrap();

        let result = suite.open(&key(1), &nonce, b"epoch=2", &mut buffer, &tag);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    proptest! {
        #[test]
        fn any_bit_flip_is_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..128),
            flip in any::<prop::sample::Index>(),
        ) {
            let suite = XChaCha20Poly1305Suite;
            let nonce = PacketNonce::new(3, 4, 5);
            let mut buffer = plaintext.clone();
            let tag = suite.seal(&key(9), &nonce, b"aad", &mut buffer).unwrap();

            let index = flip.index(buffer.len());
            buffer[index] ^= 0x01;
            prop_assert!(suite.open(&key(9), &nonce, b"aad", &mut buffer, &tag).is_err());
        }
    }
}
