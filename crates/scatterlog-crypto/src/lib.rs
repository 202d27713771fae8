//! Cryptographic primitives for Scatterlog.
//!
//! Two jobs live here. Message packets are sealed with a per-(source, epoch)
//! symmetric key under an AEAD whose nonce is derived from the packet header,
//! so nothing but the tag travels alongside the ciphertext. Key requests are
//! authenticated and key grants are wrapped by a [`CredentialScheme`], by
//! default a pre-shared secret.
//!
//! Nothing in this crate does I/O or reads a clock. Callers pass time in as
//! unix seconds.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod credential;
pub mod error;
pub mod key;

pub use cipher::{CipherSuite, NONCE_SIZE, PacketNonce, TAG_SIZE, XChaCha20Poly1305Suite};
pub use credential::{CredentialScheme, RequestContext, SharedSecret};
pub use error::CryptoError;
pub use key::{KEY_SIZE, KeyMaterial, SecretKey, Validity};
pub use zeroize::Zeroizing;
