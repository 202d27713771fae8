//! Key request authentication and grant wrapping.
//!
//! A receiver proves it may read a publisher's logs by attaching a
//! credential to each key request. The listener answers with the key sealed
//! so that only the holder of the same credentials, asking with the same
//! nonce, can open it.
//!
//! Both directions are bound to a [`RequestContext`]: the publisher's
//! canonical identity bytes, the epoch and the request nonce. A credential
//! captured for one request is useless for any other, and a grant captured
//! off the wire opens for nobody who lacks the secret.

use std::fmt;

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{CryptoError, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_LABEL: &[u8] = b"scatterlog v1 key request";
const GRANT_LABEL: &[u8] = b"scatterlog v1 grant wrap";

/// What a credential or grant is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext<'a> {
    /// Canonical publisher identity bytes
    pub source: &'a [u8],
    /// Requested epoch
    pub epoch: u32,
    /// Request nonce
    pub nonce: u64,
}

impl RequestContext<'_> {
    fn transcript(&self, label: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(label.len() + 2 + self.source.len() + 12);
        out.extend_from_slice(label);
        out.extend_from_slice(&(self.source.len() as u16).to_be_bytes());
        out.extend_from_slice(self.source);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out
    }
}

/// Authenticates key requests and protects key grants.
///
/// Injected into both the requesting side and the key listener; both must be
/// configured with matching schemes.
pub trait CredentialScheme: Send + Sync + fmt::Debug {
    /// Credential to attach to a request.
    fn sign_request(&self, context: &RequestContext<'_>) -> Result<Vec<u8>, CryptoError>;

    /// Whether `credential` is valid for `context`. Must not leak timing.
    fn verify_request(&self, context: &RequestContext<'_>, credential: &[u8]) -> bool;

    /// Encrypt a grant plaintext for the requester of `context`.
    fn seal_grant(
        &self,
        context: &RequestContext<'_>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a sealed grant received in reply to `context`.
    ///
    /// The plaintext carries a key secret and is wiped on drop.
    fn open_grant(
        &self,
        context: &RequestContext<'_>,
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Pre-shared secret scheme.
///
/// Requests carry HMAC-SHA256 over the context. Grants are sealed with
/// XChaCha20-Poly1305 under a key and nonce expanded by HKDF-SHA256 from the
/// secret, salted with the request nonce.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Zeroizing<Vec<u8>>,
}

impl SharedSecret {
    /// Shortest accepted secret.
    pub const MIN_SIZE: usize = 16;

    /// Wrap a secret.
    ///
    /// # Errors
    ///
    /// `WeakSecret` if shorter than [`Self::MIN_SIZE`].
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let secret = Zeroizing::new(secret.into());
        if secret.len() < Self::MIN_SIZE {
            return Err(CryptoError::WeakSecret { min: Self::MIN_SIZE, actual: secret.len() });
        }
        Ok(Self { secret })
    }

    fn mac(&self, context: &RequestContext<'_>) -> Result<HmacSha256, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| CryptoError::KeyDerivation)?;
        mac.update(&context.transcript(REQUEST_LABEL));
        Ok(mac)
    }

    fn wrap_cipher(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<(XChaCha20Poly1305, Zeroizing<[u8; NONCE_SIZE]>), CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&context.nonce.to_be_bytes()[..]), &self.secret);
        let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
        hk.expand(&context.transcript(GRANT_LABEL), &mut okm[..])
            .map_err(|_| CryptoError::KeyDerivation)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&okm[..KEY_SIZE]));
        let mut nonce = Zeroizing::new([0u8; NONCE_SIZE]);
        nonce.copy_from_slice(&okm[KEY_SIZE..]);
        Ok((cipher, nonce))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl CredentialScheme for SharedSecret {
    fn sign_request(&self, context: &RequestContext<'_>) -> Result<Vec<u8>, CryptoError> {
        Ok(self.mac(context)?.finalize().into_bytes().to_vec())
    }

    fn verify_request(&self, context: &RequestContext<'_>, credential: &[u8]) -> bool {
        match self.mac(context) {
            Ok(mac) => mac.verify_slice(credential).is_ok(),
            Err(_) => false,
        }
    }

    fn seal_grant(
        &self,
        context: &RequestContext<'_>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (cipher, nonce) = self.wrap_cipher(context)?;
        let aad = context.transcript(GRANT_LABEL);
        cipher
            .encrypt(XNonce::from_slice(&nonce[..]), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CryptoError::SealFailed)
    }

    fn open_grant(
        &self,
        context: &RequestContext<'_>,
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::Truncated { expected: TAG_SIZE, actual: sealed.len() });
        }
        let (cipher, nonce) = self.wrap_cipher(context)?;
        let aad = context.transcript(GRANT_LABEL);
        cipher
            .decrypt(XNonce::from_slice(&nonce[..]), Payload { msg: sealed, aad: &aad })
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const SOURCE: &[u8] = b"10.0.0.1:7400#0000000000000007";

    fn scheme() -> SharedSecret {
        SharedSecret::new(b"correct horse battery staple".to_vec()).unwrap()
    }

    fn context(epoch: u32, nonce: u64) -> RequestContext<'static> {
        RequestContext { source: SOURCE, epoch, nonce }
    }

    #[test]
    fn short_secret_is_rejected() {
        let result = SharedSecret::new(b"short".to_vec());
        assert!(matches!(result, Err(CryptoError::WeakSecret { min: 16, actual: 5 })));
    }

    #[test]
    fn credential_verifies_for_its_context_only() {
        let scheme = scheme();
        let credential = scheme.sign_request(&context(3, 11)).unwrap();

        assert_eq!(credential.len(), 32);
        assert!(scheme.verify_request(&context(3, 11), &credential));
        assert!(!scheme.verify_request(&context(4, 11), &credential));
        assert!(!scheme.verify_request(&context(3, 12), &credential));
        assert!(!scheme.verify_request(&context(3, 11), &credential[..31]));
    }

    #[test]
    fn different_secrets_do_not_interoperate() {
        let other = SharedSecret::new(b"a completely different secret".to_vec()).unwrap();
        let credential = other.sign_request(&context(1, 1)).unwrap();
        assert!(!scheme().verify_request(&context(1, 1), &credential));
    }

    #[test]
    fn grant_opens_for_matching_context() {
        let scheme = scheme();
        let sealed = scheme.seal_grant(&context(2, 99), b"grant plaintext").unwrap();

        assert_ne!(&sealed[..15], b"grant plaintext");
        let opened = scheme.open_grant(&context(2, 99), &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"grant plaintext");
    }

    #[test]
    fn grant_does_not_open_for_other_nonce() {
        let scheme = scheme();
        let sealed = scheme.seal_grant(&context(2, 99), b"grant plaintext").unwrap();

        assert_eq!(
            scheme.open_grant(&context(2, 100), &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn truncated_grant_is_rejected() {
        assert_eq!(
            scheme().open_grant(&context(1, 1), &[0u8; 4]),
            Err(CryptoError::Truncated { expected: TAG_SIZE, actual: 4 })
        );
    }

    #[test]
    fn debug_redacts_secret() {
        assert_eq!(format!("{:?}", scheme()), "SharedSecret(<redacted>)");
    }

    proptest! {
        #[test]
        fn forged_credentials_never_verify(
            forged in proptest::collection::vec(any::<u8>(), 0..64),
            epoch in any::<u32>(),
            nonce in any::<u64>(),
        ) {
            let scheme = scheme();
            let genuine = scheme.sign_request(&context(epoch, nonce)).unwrap();
            prop_assume!(forged != genuine);
            prop_assert!(!scheme.verify_request(&context(epoch, nonce), &forged));
        }
    }
}
