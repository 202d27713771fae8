//! Key listener: serves a publisher's own key history.
//!
//! The listener is the only authority on which keys a publisher will hand
//! out. It keeps the current epoch plus up to `retained_epochs - 1`
//! immediately prior ones and never serves anything else, which bounds how
//! long a delayed or replayed request can still extract a key.
//!
//! Request handling order matters:
//!
//! 1. Credential check. A bad credential gets `AuthFailed` before the epoch
//!    is even looked at, so unauthenticated callers learn nothing about
//!    which epochs exist.
//! 2. Epoch lookup. Unknown, retired, expired or foreign epochs all get
//!    the same `UnknownEpoch`.
//! 3. The key is sealed to the request's context and returned `Granted`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use scatterlog_crypto::{CredentialScheme, KeyMaterial, RequestContext, Zeroizing};
use scatterlog_proto::{
    Epoch, KeyExchange, KeyGrant, KeyReply, KeyReplyStatus, KeyRequest, SealedGrant,
    SourceIdentity,
};

use crate::ListenerError;

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Epochs served: the current one plus `retained_epochs - 1` prior
    pub retained_epochs: usize,
    /// Tolerance before a key counts as expired
    pub clock_skew: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { retained_epochs: 3, clock_skew: Duration::from_secs(30) }
    }
}

/// Answers key requests for one publisher identity.
#[derive(Debug)]
pub struct KeyListener {
    identity: SourceIdentity,
    config: ListenerConfig,
    history: BTreeMap<Epoch, KeyMaterial>,
    credentials: Arc<dyn CredentialScheme>,
}

impl KeyListener {
    /// Listener for `identity` with an empty history.
    pub fn new(
        identity: SourceIdentity,
        config: ListenerConfig,
        credentials: Arc<dyn CredentialScheme>,
    ) -> Self {
        Self { identity, config, history: BTreeMap::new(), credentials }
    }

    /// Identity whose keys are served.
    pub fn identity(&self) -> SourceIdentity {
        self.identity
    }

    /// Add the key of a new epoch. Returns the epochs retired to make room.
    ///
    /// # Errors
    ///
    /// `EpochNotAdvanced` unless `epoch` is newer than every installed one.
    pub fn install(&mut self, epoch: Epoch, key: KeyMaterial) -> Result<Vec<Epoch>, ListenerError> {
        match self.current_epoch() {
            Some(newest) if epoch <= newest => {
                return Err(ListenerError::EpochNotAdvanced { newest, requested: epoch });
            },
            _ => {},
        }

        self.history.insert(epoch, key);

        let mut retired = Vec::new();
        while self.history.len() > self.config.retained_epochs.max(1) {
            if let Some((old, _)) = self.history.pop_first() {
                retired.push(old);
            }
        }
        Ok(retired)
    }

    /// Newest installed epoch.
    pub fn current_epoch(&self) -> Option<Epoch> {
        self.history.keys().next_back().copied()
    }

    /// Epochs currently retained, oldest first.
    pub fn served_epochs(&self) -> impl Iterator<Item = Epoch> + '_ {
        self.history.keys().copied()
    }

    /// Key for `epoch` if it is still served at `wall`.
    pub fn key(&self, epoch: Epoch, wall: u64) -> Option<&KeyMaterial> {
        let skew = self.config.clock_skew.as_secs();
        self.history.get(&epoch).filter(|key| !key.is_expired(wall, skew))
    }

    /// Answer one request.
    ///
    /// # Errors
    ///
    /// Only if sealing the grant fails. Every protocol-level refusal is an
    /// `Ok` reply.
    pub fn handle_request(&self, request: &KeyRequest, wall: u64) -> Result<KeyReply, ListenerError> {
        let source = request.source.canonical_bytes();
        let context = RequestContext { source: &source, epoch: request.epoch, nonce: request.nonce };

        if !self.credentials.verify_request(&context, &request.credential) {
            return Ok(KeyReply { nonce: request.nonce, status: KeyReplyStatus::AuthFailed });
        }

        let key = (request.source == self.identity)
            .then(|| self.key(request.epoch, wall))
            .flatten();
        let Some(key) = key else {
            return Ok(KeyReply { nonce: request.nonce, status: KeyReplyStatus::UnknownEpoch });
        };

        let validity = key.validity();
        let grant = KeyGrant {
            epoch: request.epoch,
            secret: Zeroizing::new(*key.secret().as_bytes()),
            created_at: key.created_at(),
            not_before: validity.not_before,
            not_after: validity.not_after,
        };
        let sealed = self.credentials.seal_grant(&context, &grant.to_cbor()?)?;

        Ok(KeyReply { nonce: request.nonce, status: KeyReplyStatus::Granted(SealedGrant(sealed)) })
    }

    /// Decode a request datagram and answer it.
    ///
    /// Returns the decoded request alongside the reply so the caller can log
    /// who asked for what.
    ///
    /// # Errors
    ///
    /// Malformed datagrams, replies sent to the listener, and sealing
    /// failures. Nothing should be sent back for any of them.
    pub fn handle_datagram(
        &self,
        datagram: &[u8],
        wall: u64,
    ) -> Result<(KeyRequest, KeyReply), ListenerError> {
        match KeyExchange::decode(datagram)? {
            KeyExchange::Request(request) => {
                let reply = self.handle_request(&request, wall)?;
                Ok((request, reply))
            },
            KeyExchange::Reply(_) => Err(ListenerError::UnexpectedReply),
        }
    }

    /// Drop keys expired at `wall`. Returns their epochs.
    pub fn sweep(&mut self, wall: u64) -> Vec<Epoch> {
        let skew = self.config.clock_skew.as_secs();
        let expired: Vec<Epoch> = self
            .history
            .iter()
            .filter(|(_, key)| key.is_expired(wall, skew))
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in &expired {
            self.history.remove(epoch);
        }
        expired
    }
}
