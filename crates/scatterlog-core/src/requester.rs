//! Key requester state machine.
//!
//! Resolves one cache miss: fetches the key for a single (source, epoch)
//! from that publisher's key listener, retrying with exponential backoff.
//! One instance per outstanding key; instances are independent.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as a parameter (no stored Environment)
//! - Methods return actions; the driver sends requests, installs keys and
//!   releases waiters
//! - Reply correlation by nonce; the transport below owns no retry logic
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ start  ┌────────────┐  valid grant   ┌───────────┐
//! │ Idle │───────>│ Requesting │───────────────>│ Succeeded │
//! └──────┘        └────────────┘                └───────────┘
//!                   │  ↑     │
//!          deadline │  │     │ UnknownEpoch / AuthFailed /
//!                   ↓  │     │ retries exhausted / cancel
//!                ┌──────────┐│                  ┌────────┐
//!                │ Retrying ││─────────────────>│ Failed │
//!                └──────────┘                   └────────┘
//!                  resend_at
//! ```
//!
//! Every attempt uses its own nonce (`base + attempt`). A reply to any
//! earlier attempt is still accepted, since its grant is sealed to that
//! attempt's nonce; replies carrying nonces never issued are ignored.
//!
//! A reply whose grant fails to open or validate does not end the request.
//! Anyone can put bytes on the wire; only the deadline decides that a
//! listener has gone quiet.
//!
//! Once `Succeeded` or `Failed` the instance is finished. A later miss for
//! the same key starts a fresh instance from `Idle`.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use scatterlog_crypto::{CredentialScheme, KeyMaterial, RequestContext, Validity};
use scatterlog_proto::{KeyGrant, KeyReply, KeyReplyStatus, KeyRequest, SealedGrant};
use thiserror::Error;

use crate::{RequesterError, key_cache::KeyId};

/// Retry and timeout settings.
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// How long to wait for a reply to one attempt
    pub request_timeout: Duration,
    /// Backoff after the first timed-out attempt
    pub base_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Tolerance when checking a granted key's validity window
    pub clock_skew: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_retries: 4,
            clock_skew: Duration::from_secs(30),
        }
    }
}

impl RequesterConfig {
    /// Delay before resending after attempt `attempt` (1-based) timed out.
    ///
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff.saturating_mul(1 << exponent).min(self.max_backoff)
    }

    /// Longest time an instance can stay unfinished when nothing answers.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_retries + 1;
        let waiting = self.request_timeout.saturating_mul(attempts);
        (1..attempts).fold(waiting, |total, attempt| total.saturating_add(self.backoff(attempt)))
    }
}

/// Why a request ended without a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// No usable reply within the retry budget
    #[error("no reply after {attempts} attempts")]
    Exhausted {
        /// Attempts sent
        attempts: u32,
    },
    /// Listener does not serve the epoch
    #[error("listener does not serve this epoch")]
    UnknownEpoch,
    /// Listener rejected our credential
    #[error("listener rejected credential")]
    AuthRejected,
    /// Request was cancelled by shutdown
    #[error("cancelled")]
    Cancelled,
    /// Our own credential could not be produced
    #[error("credential unavailable")]
    CredentialUnavailable,
}

/// Why a granted reply was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrantRejection {
    /// Sealed grant did not open for this request
    #[error("grant did not open")]
    Unsealable,
    /// Opened grant did not parse or has an inverted validity window
    #[error("malformed grant")]
    Malformed,
    /// Grant is for another epoch
    #[error("grant for epoch {actual}, requested {expected}")]
    WrongEpoch {
        /// Requested epoch
        expected: u32,
        /// Granted epoch
        actual: u32,
    },
    /// Grant expired beyond clock skew
    #[error("grant expired at {not_after}")]
    Expired {
        /// End of validity, unix seconds
        not_after: u64,
    },
}

/// Requester state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    /// Nothing sent yet
    Idle,
    /// Attempt `attempt` is out, waiting until `deadline`
    Requesting {
        /// 1-based attempt number
        attempt: u32,
        /// Reply deadline
        deadline: Instant,
    },
    /// Attempt `attempt` timed out, next one goes out at `resend_at`
    Retrying {
        /// Attempt that timed out
        attempt: u32,
        /// When to resend
        resend_at: Instant,
    },
    /// Key obtained
    Succeeded,
    /// Gave up
    Failed(FailureReason),
}

/// Actions for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequesterAction {
    /// Send this request to the listener
    Send {
        /// Listener endpoint
        endpoint: SocketAddr,
        /// Request to encode and send
        request: KeyRequest,
    },
    /// Key obtained: install it and release waiters in FIFO order
    Installed(KeyMaterial),
    /// Request failed: release waiters with this reason
    GaveUp(FailureReason),
    /// A reply was ignored. Worth a log line, possibly a security event.
    Rejected {
        /// Nonce the reply carried
        nonce: u64,
        /// What was wrong with it
        reason: GrantRejection,
    },
}

/// State machine fetching one key.
#[derive(Debug, Clone)]
pub struct KeyRequester {
    id: KeyId,
    endpoint: SocketAddr,
    base_nonce: u64,
    state: RequesterState,
    config: RequesterConfig,
    credentials: Arc<dyn CredentialScheme>,
}

impl KeyRequester {
    /// New requester for `id`, asking the listener at `id.source.endpoint`.
    ///
    /// `base_nonce` should be random so that replies to one instance are
    /// never mistaken for replies to another.
    pub fn new(
        id: KeyId,
        base_nonce: u64,
        config: RequesterConfig,
        credentials: Arc<dyn CredentialScheme>,
    ) -> Self {
        Self {
            id,
            endpoint: id.source.endpoint,
            base_nonce,
            state: RequesterState::Idle,
            config,
            credentials,
        }
    }

    /// Key this instance is fetching.
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RequesterState {
        self.state
    }

    /// Whether the instance reached `Succeeded` or `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RequesterState::Succeeded | RequesterState::Failed(_))
    }

    /// Attempts sent so far.
    pub fn attempts(&self) -> u32 {
        match self.state {
            RequesterState::Requesting { attempt, .. } | RequesterState::Retrying { attempt, .. } => {
                attempt
            },
            _ => 0,
        }
    }

    /// Nonce used by attempt `attempt`.
    pub fn nonce_for(&self, attempt: u32) -> u64 {
        self.base_nonce.wrapping_add(u64::from(attempt))
    }

    /// When [`KeyRequester::tick`] next has something to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            RequesterState::Requesting { deadline, .. } => Some(deadline),
            RequesterState::Retrying { resend_at, .. } => Some(resend_at),
            _ => None,
        }
    }

    /// Send the first request.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Idle`.
    pub fn start(&mut self, now: Instant) -> Result<Vec<RequesterAction>, RequesterError> {
        if self.state != RequesterState::Idle {
            return Err(RequesterError::InvalidState {
                state: self.state,
                operation: "start".to_string(),
            });
        }
        Ok(self.send_attempt(1, now))
    }

    /// Handle a reply from the listener.
    ///
    /// `wall` is unix seconds, used to check the granted validity window.
    pub fn handle_reply(&mut self, reply: &KeyReply, wall: u64) -> Vec<RequesterAction> {
        let issued = match self.state {
            RequesterState::Requesting { attempt, .. } | RequesterState::Retrying { attempt, .. } => {
                attempt
            },
            _ => return Vec::new(),
        };

        let offset = reply.nonce.wrapping_sub(self.base_nonce);
        if offset == 0 || offset > u64::from(issued) {
            return Vec::new();
        }

        match &reply.status {
            KeyReplyStatus::Granted(sealed) => match self.open_grant(reply.nonce, sealed, wall) {
                Ok(key) => {
                    self.state = RequesterState::Succeeded;
                    vec![RequesterAction::Installed(key)]
                },
                Err(reason) => vec![RequesterAction::Rejected { nonce: reply.nonce, reason }],
            },
            KeyReplyStatus::UnknownEpoch => self.give_up(FailureReason::UnknownEpoch),
            KeyReplyStatus::AuthFailed => self.give_up(FailureReason::AuthRejected),
        }
    }

    /// Advance timers.
    ///
    /// A timed-out attempt moves to `Retrying` with backoff, or to `Failed`
    /// once the retry budget is spent. A due retry is sent.
    pub fn tick(&mut self, now: Instant) -> Vec<RequesterAction> {
        match self.state {
            RequesterState::Requesting { attempt, deadline } if now >= deadline => {
                if attempt > self.config.max_retries {
                    return self.give_up(FailureReason::Exhausted { attempts: attempt });
                }
                let resend_at = now + self.config.backoff(attempt);
                self.state = RequesterState::Retrying { attempt, resend_at };
                if resend_at <= now { self.send_attempt(attempt + 1, now) } else { Vec::new() }
            },
            RequesterState::Retrying { attempt, resend_at } if now >= resend_at => {
                self.send_attempt(attempt + 1, now)
            },
            _ => Vec::new(),
        }
    }

    /// Abandon the request.
    ///
    /// Yields `GaveUp(Cancelled)` unless already finished.
    pub fn cancel(&mut self) -> Vec<RequesterAction> {
        if self.is_finished() {
            return Vec::new();
        }
        self.give_up(FailureReason::Cancelled)
    }

    fn send_attempt(&mut self, attempt: u32, now: Instant) -> Vec<RequesterAction> {
        let nonce = self.nonce_for(attempt);
        let source = self.id.source.canonical_bytes();
        let context = RequestContext { source: &source, epoch: self.id.epoch, nonce };

        let Ok(credential) = self.credentials.sign_request(&context) else {
            return self.give_up(FailureReason::CredentialUnavailable);
        };

        self.state =
            RequesterState::Requesting { attempt, deadline: now + self.config.request_timeout };

        vec![RequesterAction::Send {
            endpoint: self.endpoint,
            request: KeyRequest { source: self.id.source, epoch: self.id.epoch, nonce, credential },
        }]
    }

    fn give_up(&mut self, reason: FailureReason) -> Vec<RequesterAction> {
        self.state = RequesterState::Failed(reason);
        vec![RequesterAction::GaveUp(reason)]
    }

    fn open_grant(
        &self,
        nonce: u64,
        sealed: &SealedGrant,
        wall: u64,
    ) -> Result<KeyMaterial, GrantRejection> {
        let source = self.id.source.canonical_bytes();
        let context = RequestContext { source: &source, epoch: self.id.epoch, nonce };

        let plaintext = self
            .credentials
            .open_grant(&context, &sealed.0)
            .map_err(|_| GrantRejection::Unsealable)?;
        let grant = KeyGrant::from_cbor(&plaintext).map_err(|_| GrantRejection::Malformed)?;

        if grant.epoch != self.id.epoch {
            return Err(GrantRejection::WrongEpoch { expected: self.id.epoch, actual: grant.epoch });
        }

        let validity = Validity { not_before: grant.not_before, not_after: grant.not_after };
        let key = KeyMaterial::new(*grant.secret, grant.created_at, validity)
            .map_err(|_| GrantRejection::Malformed)?;

        if key.is_expired(wall, self.config.clock_skew.as_secs()) {
            return Err(GrantRejection::Expired { not_after: grant.not_after });
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use scatterlog_crypto::{KEY_SIZE, SharedSecret, Zeroizing};
    use scatterlog_proto::SourceIdentity;

    use super::*;

    const WALL: u64 = 1_700_000_000;

    fn scheme() -> Arc<dyn CredentialScheme> {
        Arc::new(SharedSecret::new(b"0123456789abcdef0123".to_vec()).unwrap())
    }

    fn id(epoch: u32) -> KeyId {
        let source = SourceIdentity::new(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7400)), 5);
        KeyId::new(source, epoch)
    }

    fn requester(config: RequesterConfig) -> KeyRequester {
        KeyRequester::new(id(1), 1000, config, scheme())
    }

    fn sent_request(actions: &[RequesterAction]) -> KeyRequest {
        match actions {
            [RequesterAction::Send { request, .. }] => request.clone(),
            other => panic!("expected one Send, got {other:?}"),
        }
    }

    fn granted(request: &KeyRequest, epoch: u32, not_after: u64) -> KeyReply {
        granted_window(request, epoch, WALL - 7200, not_after)
    }

    fn granted_window(request: &KeyRequest, epoch: u32, not_before: u64, not_after: u64) -> KeyReply {
        let grant = KeyGrant {
            epoch,
            secret: Zeroizing::new([7; KEY_SIZE]),
            created_at: not_before,
            not_before,
            not_after,
        };
        let source = request.source.canonical_bytes();
        let context = RequestContext { source: &source, epoch: request.epoch, nonce: request.nonce };
        let sealed = scheme().seal_grant(&context, &grant.to_cbor().unwrap()).unwrap();
        KeyReply { nonce: request.nonce, status: KeyReplyStatus::Granted(SealedGrant(sealed)) }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = RequesterConfig {
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_secs(1));
        assert_eq!(config.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn start_sends_signed_request() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());

        let actions = fsm.start(t0).unwrap();
        let request = sent_request(&actions);
        assert_eq!(request.epoch, 1);
        assert_eq!(request.nonce, 1001);
        assert!(matches!(fsm.state(), RequesterState::Requesting { attempt: 1, .. }));

        let source = request.source.canonical_bytes();
        let context = RequestContext { source: &source, epoch: 1, nonce: 1001 };
        assert!(scheme().verify_request(&context, &request.credential));
    }

    #[test]
    fn start_twice_is_invalid() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        fsm.start(t0).unwrap();
        assert!(matches!(fsm.start(t0), Err(RequesterError::InvalidState { .. })));
    }

    #[test]
    fn valid_grant_succeeds() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let request = sent_request(&fsm.start(t0).unwrap());

        let actions = fsm.handle_reply(&granted(&request, 1, WALL + 3600), WALL);
        match actions.as_slice() {
            [RequesterAction::Installed(key)] => assert_eq!(key.secret().as_bytes(), &[7; KEY_SIZE]),
            other => panic!("expected Installed, got {other:?}"),
        }
        assert_eq!(fsm.state(), RequesterState::Succeeded);
        assert_eq!(fsm.next_deadline(), None);
    }

    #[test]
    fn unknown_nonce_is_ignored() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let mut request = sent_request(&fsm.start(t0).unwrap());
        request.nonce = 1002;

        assert!(fsm.handle_reply(&granted(&request, 1, WALL + 3600), WALL).is_empty());
        assert!(matches!(fsm.state(), RequesterState::Requesting { attempt: 1, .. }));
    }

    #[test]
    fn reply_to_earlier_attempt_is_accepted() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let first = sent_request(&fsm.start(t0).unwrap());

        let t1 = t0 + Duration::from_millis(500);
        fsm.tick(t1);
        let second = sent_request(&fsm.tick(t1 + Duration::from_millis(200)));
        assert_ne!(first.nonce, second.nonce);

        let actions = fsm.handle_reply(&granted(&first, 1, WALL + 3600), WALL);
        assert!(matches!(actions.as_slice(), [RequesterAction::Installed(_)]));
    }

    #[test]
    fn bad_grants_are_rejected_without_ending_request() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let request = sent_request(&fsm.start(t0).unwrap());

        let wrong_epoch = fsm.handle_reply(&granted(&request, 2, WALL + 3600), WALL);
        assert_eq!(
            wrong_epoch,
            vec![RequesterAction::Rejected {
                nonce: request.nonce,
                reason: GrantRejection::WrongEpoch { expected: 1, actual: 2 },
            }]
        );

        let expired = fsm.handle_reply(&granted(&request, 1, WALL - 100), WALL);
        assert_eq!(
            expired,
            vec![RequesterAction::Rejected {
                nonce: request.nonce,
                reason: GrantRejection::Expired { not_after: WALL - 100 },
            }]
        );

        let forged = KeyReply {
            nonce: request.nonce,
            status: KeyReplyStatus::Granted(SealedGrant(vec![0; 64])),
        };
        assert_eq!(
            fsm.handle_reply(&forged, WALL),
            vec![RequesterAction::Rejected { nonce: request.nonce, reason: GrantRejection::Unsealable }]
        );

        assert!(matches!(fsm.state(), RequesterState::Requesting { .. }));
    }

    #[test]
    fn inverted_validity_window_is_malformed() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let request = sent_request(&fsm.start(t0).unwrap());

        let inverted = fsm.handle_reply(&granted_window(&request, 1, WALL - 10, WALL - 100), WALL);
        assert_eq!(
            inverted,
            vec![RequesterAction::Rejected { nonce: request.nonce, reason: GrantRejection::Malformed }]
        );

        // Still waiting, and a good grant afterwards completes the request.
        let actions = fsm.handle_reply(&granted(&request, 1, WALL + 3600), WALL);
        assert!(matches!(actions.as_slice(), [RequesterAction::Installed(_)]));
    }

    #[test]
    fn unknown_epoch_fails_without_retry() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let request = sent_request(&fsm.start(t0).unwrap());

        let reply = KeyReply { nonce: request.nonce, status: KeyReplyStatus::UnknownEpoch };
        assert_eq!(fsm.handle_reply(&reply, WALL), vec![RequesterAction::GaveUp(FailureReason::UnknownEpoch)]);
        assert_eq!(fsm.state(), RequesterState::Failed(FailureReason::UnknownEpoch));

        assert!(fsm.tick(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(fsm.next_deadline(), None);
    }

    #[test]
    fn auth_failure_is_terminal() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        let request = sent_request(&fsm.start(t0).unwrap());

        let reply = KeyReply { nonce: request.nonce, status: KeyReplyStatus::AuthFailed };
        assert_eq!(fsm.handle_reply(&reply, WALL), vec![RequesterAction::GaveUp(FailureReason::AuthRejected)]);
    }

    #[test]
    fn silence_exhausts_retry_budget() {
        let config = RequesterConfig { max_retries: 2, ..Default::default() };
        let t0 = Instant::now();
        let mut fsm = requester(config.clone());
        fsm.start(t0).unwrap();

        let mut now = t0;
        let mut sends = 1;
        let mut outcome = None;
        while let Some(deadline) = fsm.next_deadline() {
            now = deadline;
            for action in fsm.tick(now) {
                match action {
                    RequesterAction::Send { .. } => sends += 1,
                    RequesterAction::GaveUp(reason) => outcome = Some(reason),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }

        assert_eq!(sends, 3);
        assert_eq!(outcome, Some(FailureReason::Exhausted { attempts: 3 }));
        assert_eq!(now - t0, config.worst_case());
    }

    #[test]
    fn cancel_is_idempotent() {
        let t0 = Instant::now();
        let mut fsm = requester(RequesterConfig::default());
        fsm.start(t0).unwrap();

        assert_eq!(fsm.cancel(), vec![RequesterAction::GaveUp(FailureReason::Cancelled)]);
        assert!(fsm.cancel().is_empty());
    }

    #[test]
    fn zero_backoff_resends_on_timeout() {
        let config = RequesterConfig { base_backoff: Duration::ZERO, ..Default::default() };
        let t0 = Instant::now();
        let mut fsm = requester(config);
        fsm.start(t0).unwrap();

        let request = sent_request(&fsm.tick(t0 + Duration::from_millis(500)));
        assert_eq!(request.nonce, 1002);
    }
}
