//! Keys by (source, epoch), with in-flight request deduplication.
//!
//! Each entry is in one of three states:
//!
//! - `Ready`: key available, handed out by clone
//! - `Pending`: a request is in flight; decodes that need the key wait in a
//!   FIFO queue on the entry
//! - `Failed`: the last request failed; remembered for a short negative TTL
//!   so a listener without the key is not asked again immediately
//!
//! At most one `Pending` entry exists per key, so any number of concurrent
//! misses produce exactly one request. The waiter type `W` is whatever the
//! caller needs to resume a decode (typically the framed packet).
//!
//! Expiry is purely time based. An expired key is evicted on the next
//! lookup or sweep; clones already handed out stay usable for the decode
//! that took them.

use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    fmt,
    time::{Duration, Instant},
};

use scatterlog_crypto::KeyMaterial;
use scatterlog_proto::{Epoch, SourceIdentity};

use crate::requester::FailureReason;

/// Cache key: one publisher's key for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId {
    /// Publisher
    pub source: SourceIdentity,
    /// Epoch
    pub epoch: Epoch,
}

impl KeyId {
    /// Create a key id.
    pub fn new(source: SourceIdentity, epoch: Epoch) -> Self {
        Self { source, epoch }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.epoch)
    }
}

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Tolerance on key validity windows
    pub clock_skew: Duration,
    /// How long a failed request is remembered
    pub negative_ttl: Duration,
    /// Most decodes queued behind one pending key
    pub max_waiters: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(5),
            max_waiters: 256,
        }
    }
}

/// Result of [`KeyCache::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Key available
    Hit(KeyMaterial),
    /// Not available (absent, pending, failed or just expired)
    Miss,
}

/// Why a waiter was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRejection {
    /// Queue behind the pending key is full
    QueueFull,
    /// Key recently failed and is negatively cached
    Failed(FailureReason),
}

/// Result of [`KeyCache::await_key`].
#[derive(Debug)]
pub enum AwaitOutcome<W> {
    /// Key was already there. The waiter is handed back to run now.
    Ready(KeyMaterial, W),
    /// Joined an existing pending request
    Queued,
    /// Opened a new pending entry. The caller must start a requester.
    Started,
    /// Not queued. The waiter is handed back to be discarded.
    Rejected(W, QueueRejection),
}

/// A request in flight and the decodes waiting on it.
#[derive(Debug)]
pub struct PendingRequest<W> {
    waiters: VecDeque<W>,
    opened_at: Instant,
    attempt: u32,
    next_deadline: Option<Instant>,
}

impl<W> PendingRequest<W> {
    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// When the entry was opened.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Latest attempt reported by the requester.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Latest deadline reported by the requester.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline
    }
}

#[derive(Debug)]
enum CacheEntry<W> {
    Ready(KeyMaterial),
    Pending(PendingRequest<W>),
    Failed { reason: FailureReason, until: Instant },
}

/// Key cache with per-key waiter queues.
///
/// Not internally synchronized; the runtime wraps it in a mutex.
#[derive(Debug)]
pub struct KeyCache<W> {
    config: CacheConfig,
    entries: HashMap<KeyId, CacheEntry<W>>,
}

impl<W> KeyCache<W> {
    /// Empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self { config, entries: HashMap::new() }
    }

    fn skew(&self) -> u64 {
        self.config.clock_skew.as_secs()
    }

    /// Key for `id` if present and not expired at `wall`.
    ///
    /// An expired key is evicted here.
    pub fn lookup(&mut self, id: &KeyId, wall: u64) -> Lookup {
        let skew = self.skew();
        let expired = match self.entries.get(id) {
            Some(CacheEntry::Ready(key)) if !key.is_expired(wall, skew) => {
                return Lookup::Hit(key.clone());
            },
            Some(CacheEntry::Ready(_)) => true,
            _ => false,
        };
        if expired {
            self.entries.remove(id);
        }
        Lookup::Miss
    }

    /// Register interest in `id`.
    ///
    /// Exactly one caller per miss gets `Started`; everyone else who arrives
    /// while the request is in flight gets `Queued`.
    pub fn await_key(&mut self, id: KeyId, waiter: W, now: Instant, wall: u64) -> AwaitOutcome<W> {
        let skew = self.skew();
        let max_waiters = self.config.max_waiters;

        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                CacheEntry::Ready(key) if !key.is_expired(wall, skew) => {
                    AwaitOutcome::Ready(key.clone(), waiter)
                },
                CacheEntry::Pending(pending) if pending.waiters.len() >= max_waiters => {
                    AwaitOutcome::Rejected(waiter, QueueRejection::QueueFull)
                },
                CacheEntry::Pending(pending) => {
                    pending.waiters.push_back(waiter);
                    AwaitOutcome::Queued
                },
                CacheEntry::Failed { reason, until } if now < *until => {
                    AwaitOutcome::Rejected(waiter, QueueRejection::Failed(*reason))
                },
                // Expired key or elapsed failure: start over.
                entry => {
                    *entry = CacheEntry::Pending(PendingRequest::new(waiter, now));
                    AwaitOutcome::Started
                },
            },
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::Pending(PendingRequest::new(waiter, now)));
                AwaitOutcome::Started
            },
        }
    }

    /// Record requester progress on a pending entry.
    pub fn note_progress(&mut self, id: &KeyId, attempt: u32, next_deadline: Option<Instant>) {
        if let Some(CacheEntry::Pending(pending)) = self.entries.get_mut(id) {
            pending.attempt = attempt;
            pending.next_deadline = next_deadline;
        }
    }

    /// Install a key and release its waiters in arrival order.
    pub fn complete(&mut self, id: KeyId, key: KeyMaterial) -> Vec<W> {
        match self.entries.insert(id, CacheEntry::Ready(key)) {
            Some(CacheEntry::Pending(pending)) => pending.waiters.into(),
            _ => Vec::new(),
        }
    }

    /// Mark a request failed and release its waiters in arrival order.
    ///
    /// The failure is remembered for the negative TTL.
    pub fn fail(&mut self, id: KeyId, reason: FailureReason, now: Instant) -> Vec<W> {
        let until = now + self.config.negative_ttl;
        match self.entries.insert(id, CacheEntry::Failed { reason, until }) {
            Some(CacheEntry::Pending(pending)) => pending.waiters.into(),
            Some(CacheEntry::Ready(key)) => {
                // A late failure must not clobber a key that arrived anyway.
                self.entries.insert(id, CacheEntry::Ready(key));
                Vec::new()
            },
            _ => Vec::new(),
        }
    }

    /// Insert a key directly, without a request.
    pub fn insert(&mut self, id: KeyId, key: KeyMaterial) {
        self.entries.insert(id, CacheEntry::Ready(key));
    }

    /// Evict expired keys and elapsed failures. Returns how many went.
    pub fn sweep(&mut self, now: Instant, wall: u64) -> usize {
        let skew = self.skew();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            CacheEntry::Ready(key) => !key.is_expired(wall, skew),
            CacheEntry::Pending(_) => true,
            CacheEntry::Failed { until, .. } => now < *until,
        });
        before - self.entries.len()
    }

    /// Drop every pending entry, returning its waiters for release.
    ///
    /// Keys and negative entries stay.
    pub fn cancel_all(&mut self) -> Vec<(KeyId, Vec<W>)> {
        let pending: Vec<KeyId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, CacheEntry::Pending(_)))
            .map(|(id, _)| *id)
            .collect();

        let mut released = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(CacheEntry::Pending(request)) = self.entries.remove(&id) {
                released.push((id, request.waiters.into()));
            }
        }
        released.sort_by_key(|(id, _)| *id);
        released
    }

    /// Pending request for `id`.
    pub fn pending(&self, id: &KeyId) -> Option<&PendingRequest<W>> {
        match self.entries.get(id) {
            Some(CacheEntry::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Number of requests in flight.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|entry| matches!(entry, CacheEntry::Pending(_))).count()
    }

    /// Number of entries of any kind.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<W> PendingRequest<W> {
    fn new(first: W, now: Instant) -> Self {
        Self { waiters: VecDeque::from([first]), opened_at: now, attempt: 0, next_deadline: None }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use proptest::prelude::*;
    use scatterlog_crypto::KEY_SIZE;

    use super::*;

    const WALL: u64 = 1_700_000_000;

    fn id(epoch: Epoch) -> KeyId {
        let source = SourceIdentity::new(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 7400)), 3);
        KeyId::new(source, epoch)
    }

    fn key(not_after: u64) -> KeyMaterial {
        KeyMaterial::generate([1; KEY_SIZE], WALL - 10, not_after - (WALL - 10))
    }

    fn cache() -> KeyCache<u32> {
        KeyCache::new(CacheConfig::default())
    }

    #[test]
    fn first_miss_starts_later_misses_queue() {
        let mut cache = cache();
        let t0 = Instant::now();

        assert_eq!(cache.lookup(&id(1), WALL), Lookup::Miss);
        assert!(matches!(cache.await_key(id(1), 1, t0, WALL), AwaitOutcome::Started));
        assert!(matches!(cache.await_key(id(1), 2, t0, WALL), AwaitOutcome::Queued));
        assert!(matches!(cache.await_key(id(1), 3, t0, WALL), AwaitOutcome::Queued));
        assert_eq!(cache.pending_count(), 1);
        assert_eq!(cache.pending(&id(1)).unwrap().waiting(), 3);
    }

    #[test]
    fn complete_releases_waiters_in_order() {
        let mut cache = cache();
        let t0 = Instant::now();
        for waiter in [10, 20, 30] {
            cache.await_key(id(1), waiter, t0, WALL);
        }

        assert_eq!(cache.complete(id(1), key(WALL + 3600)), vec![10, 20, 30]);
        assert!(matches!(cache.lookup(&id(1), WALL), Lookup::Hit(_)));
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn ready_key_hands_waiter_back() {
        let mut cache = cache();
        cache.insert(id(1), key(WALL + 3600));

        match cache.await_key(id(1), 7, Instant::now(), WALL) {
            AwaitOutcome::Ready(_, waiter) => assert_eq!(waiter, 7),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn failure_is_negatively_cached() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.await_key(id(1), 1, t0, WALL);
        cache.await_key(id(1), 2, t0, WALL);

        assert_eq!(cache.fail(id(1), FailureReason::UnknownEpoch, t0), vec![1, 2]);

        match cache.await_key(id(1), 3, t0 + Duration::from_secs(1), WALL) {
            AwaitOutcome::Rejected(3, QueueRejection::Failed(FailureReason::UnknownEpoch)) => {},
            other => panic!("expected negative hit, got {other:?}"),
        }

        assert!(matches!(
            cache.await_key(id(1), 4, t0 + Duration::from_secs(5), WALL),
            AwaitOutcome::Started
        ));
    }

    #[test]
    fn late_failure_keeps_installed_key() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.await_key(id(1), 1, t0, WALL);
        cache.complete(id(1), key(WALL + 3600));

        assert!(cache.fail(id(1), FailureReason::Cancelled, t0).is_empty());
        assert!(matches!(cache.lookup(&id(1), WALL), Lookup::Hit(_)));
    }

    #[test]
    fn queue_is_bounded() {
        let mut cache = KeyCache::new(CacheConfig { max_waiters: 2, ..Default::default() });
        let t0 = Instant::now();
        cache.await_key(id(1), 1, t0, WALL);
        cache.await_key(id(1), 2, t0, WALL);

        assert!(matches!(
            cache.await_key(id(1), 3, t0, WALL),
            AwaitOutcome::Rejected(3, QueueRejection::QueueFull)
        ));
    }

    #[test]
    fn expired_key_is_evicted_on_lookup() {
        let mut cache = cache();
        cache.insert(id(1), key(WALL + 10));

        assert!(matches!(cache.lookup(&id(1), WALL + 40), Lookup::Hit(_)));
        assert_eq!(cache.lookup(&id(1), WALL + 41), Lookup::Miss);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_key_restarts_request() {
        let mut cache = cache();
        cache.insert(id(1), key(WALL + 10));

        assert!(matches!(cache.await_key(id(1), 1, Instant::now(), WALL + 100), AwaitOutcome::Started));
    }

    #[test]
    fn sweep_evicts_expired_and_elapsed() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.insert(id(1), key(WALL + 10));
        cache.insert(id(2), key(WALL + 3600));
        cache.await_key(id(3), 0, t0, WALL);
        cache.fail(id(3), FailureReason::AuthRejected, t0);
        cache.await_key(id(4), 0, t0, WALL);

        assert_eq!(cache.sweep(t0 + Duration::from_secs(6), WALL + 100), 2);
        assert!(matches!(cache.lookup(&id(2), WALL + 100), Lookup::Hit(_)));
        assert_eq!(cache.pending_count(), 1);
    }

    #[test]
    fn cancel_all_drains_pending_only() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.insert(id(1), key(WALL + 3600));
        cache.await_key(id(2), 5, t0, WALL);
        cache.await_key(id(2), 6, t0, WALL);
        cache.await_key(id(3), 7, t0, WALL);

        let released = cache.cancel_all();
        assert_eq!(released, vec![(id(2), vec![5, 6]), (id(3), vec![7])]);
        assert_eq!(cache.pending_count(), 0);
        assert!(matches!(cache.lookup(&id(1), WALL), Lookup::Hit(_)));
    }

    #[test]
    fn note_progress_updates_pending() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.await_key(id(1), 0, t0, WALL);
        cache.note_progress(&id(1), 2, Some(t0 + Duration::from_secs(1)));

        let pending = cache.pending(&id(1)).unwrap();
        assert_eq!(pending.attempt(), 2);
        assert_eq!(pending.next_deadline(), Some(t0 + Duration::from_secs(1)));
    }

    proptest! {
        #[test]
        fn concurrent_misses_start_exactly_one_request(
            misses in proptest::collection::vec(0u32..4, 1..200),
        ) {
            let mut cache = cache();
            let t0 = Instant::now();
            let mut started = std::collections::HashMap::new();

            for (waiter, epoch) in misses.iter().enumerate() {
                if let AwaitOutcome::Started = cache.await_key(id(*epoch), waiter as u32, t0, WALL) {
                    *started.entry(*epoch).or_insert(0) += 1;
                }
            }

            for epoch in misses.iter().collect::<std::collections::HashSet<_>>() {
                prop_assert_eq!(started.get(epoch).copied(), Some(1));
                let queued = misses.iter().filter(|e| *e == epoch).count();
                prop_assert_eq!(cache.pending(&id(*epoch)).unwrap().waiting(), queued);
            }
        }
    }
}
