//! Known publishers.
//!
//! The registry remembers every source a receiver has authenticated a
//! packet from: which group it was heard on, when it was last heard, its
//! newest authenticated epoch and one [`SequenceWindow`] per retained epoch.
//!
//! Two entry points split the untrusted from the trusted path:
//!
//! - [`SourceRegistry::observe`] runs on every framed packet before any key
//!   is involved. It refreshes liveness of sources already known and never
//!   creates a record or touches sequence windows, so forged headers can
//!   neither grow the table nor disturb replay state.
//! - [`SourceRegistry::accept`] runs after a packet authenticated. It
//!   creates the record on first sight, creates the epoch's window, detects
//!   rotation and decides duplicate/stale/accepted.
//!
//! [`SourceRegistry::sweep`] reports silence and forgets sources silent for
//! longer than [`RegistryConfig::forget_after`].
//!
//! [`SourceRegistry::precheck`] lets the receiver drop obvious replays before
//! spending a key request on them.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::{Duration, Instant},
};

use scatterlog_proto::{Epoch, Sequence, SourceIdentity};

use crate::sequence::{SequenceWindow, WindowVerdict};

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sequence windows kept per source, newest epochs first
    pub retained_epochs: usize,
    /// Silence after which a source is reported as silent
    pub silence_timeout: Duration,
    /// Silence after which a source's record is dropped
    pub forget_after: Duration,
}

impl RegistryConfig {
    /// Windows actually kept per source. The current epoch always has one.
    fn retained(&self) -> usize {
        self.retained_epochs.max(1)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retained_epochs: 3,
            silence_timeout: Duration::from_secs(60),
            forget_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Something observability collaborators may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// First authenticated packet from a source
    NewSource {
        /// Publisher
        source: SourceIdentity,
        /// Group it was heard on
        group: SocketAddr,
    },
    /// A source's newest authenticated epoch moved forward
    EpochRotated {
        /// Publisher
        source: SourceIdentity,
        /// Previous newest epoch
        from: Epoch,
        /// New newest epoch
        to: Epoch,
    },
    /// No packet from a source for at least the silence timeout
    PublisherSilent {
        /// Publisher
        source: SourceIdentity,
        /// Time since last packet
        silent_for: Duration,
    },
    /// A silent source was heard again
    PublisherResumed {
        /// Publisher
        source: SourceIdentity,
        /// Length of the silence
        silent_for: Duration,
    },
    /// A source was silent past the forget period and its record dropped
    PublisherForgotten {
        /// Publisher
        source: SourceIdentity,
        /// Time since last packet
        silent_for: Duration,
    },
}

/// What the registry knows about one source.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    group: SocketAddr,
    first_seen: Instant,
    last_seen: Instant,
    current_epoch: Option<Epoch>,
    last_sequence: Option<Sequence>,
    windows: BTreeMap<Epoch, SequenceWindow>,
    silent: bool,
}

impl SourceRecord {
    fn new(group: SocketAddr, now: Instant) -> Self {
        Self {
            group,
            first_seen: now,
            last_seen: now,
            current_epoch: None,
            last_sequence: None,
            windows: BTreeMap::new(),
            silent: false,
        }
    }

    /// Group the source was first heard on.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// First packet time.
    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    /// Latest packet time. Once known, unauthenticated packets count too.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Newest authenticated epoch.
    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current_epoch
    }

    /// Sequence of the latest authenticated packet in the current epoch.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }

    /// Replay window for `epoch`, if retained.
    pub fn window(&self, epoch: Epoch) -> Option<&SequenceWindow> {
        self.windows.get(&epoch)
    }

    /// Epochs with a retained window, oldest first.
    pub fn retained_epochs(&self) -> impl Iterator<Item = Epoch> + '_ {
        self.windows.keys().copied()
    }

    /// Whether the source is currently considered silent.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    fn touch(&mut self, source: SourceIdentity, now: Instant) -> Option<RegistryEvent> {
        let resumed = self.silent.then(|| RegistryEvent::PublisherResumed {
            source,
            silent_for: now.saturating_duration_since(self.last_seen),
        });
        self.silent = false;
        self.last_seen = self.last_seen.max(now);
        resumed
    }

    fn is_retired(&self, epoch: Epoch, retained: usize) -> bool {
        !self.windows.contains_key(&epoch)
            && self.windows.len() >= retained
            && self.windows.keys().next().is_some_and(|&oldest| epoch < oldest)
    }
}

/// Table of known sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    config: RegistryConfig,
    sources: HashMap<SourceIdentity, SourceRecord>,
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self { config, sources: HashMap::new() }
    }

    /// Record that a framed packet from `source` arrived.
    ///
    /// Unknown sources are ignored; only [`Self::accept`] admits a source.
    /// Returns `PublisherResumed` after a reported silence.
    pub fn observe(&mut self, source: SourceIdentity, now: Instant) -> Vec<RegistryEvent> {
        let Some(record) = self.sources.get_mut(&source) else {
            return Vec::new();
        };
        record.touch(source, now).into_iter().collect()
    }

    /// Verdict for `(source, epoch, sequence)` without recording anything.
    ///
    /// Only `Duplicate` and `Stale` are definitive. `Accepted` means "not
    /// known to be a replay"; the packet still has to authenticate.
    pub fn precheck(&self, source: &SourceIdentity, epoch: Epoch, sequence: Sequence) -> WindowVerdict {
        let Some(record) = self.sources.get(source) else {
            return WindowVerdict::Accepted { gap: 0 };
        };
        if record.is_retired(epoch, self.config.retained()) {
            return WindowVerdict::Stale;
        }
        record
            .windows
            .get(&epoch)
            .map_or(WindowVerdict::Accepted { gap: 0 }, |window| window.check(sequence))
    }

    /// Record an authenticated packet.
    ///
    /// Creates the epoch's window on first sight and retires windows beyond
    /// the newest `retained_epochs`. A newer epoch than any seen so far
    /// yields `EpochRotated`.
    pub fn accept(
        &mut self,
        source: SourceIdentity,
        group: SocketAddr,
        epoch: Epoch,
        sequence: Sequence,
        now: Instant,
    ) -> (WindowVerdict, Vec<RegistryEvent>) {
        let retained = self.config.retained();
        let mut events = Vec::new();

        let record = self.sources.entry(source).or_insert_with(|| {
            events.push(RegistryEvent::NewSource { source, group });
            SourceRecord::new(group, now)
        });
        events.extend(record.touch(source, now));

        if record.is_retired(epoch, retained) {
            return (WindowVerdict::Stale, events);
        }

        let verdict = record.windows.entry(epoch).or_default().accept(sequence);
        while record.windows.len() > retained {
            record.windows.pop_first();
        }

        if !matches!(verdict, WindowVerdict::Accepted { .. }) {
            return (verdict, events);
        }

        match record.current_epoch {
            Some(current) if epoch > current => {
                events.push(RegistryEvent::EpochRotated { source, from: current, to: epoch });
                record.current_epoch = Some(epoch);
                record.last_sequence = Some(sequence);
            },
            Some(current) if epoch == current => {
                record.last_sequence = record.last_sequence.max(Some(sequence));
            },
            Some(_) => {},
            None => {
                record.current_epoch = Some(epoch);
                record.last_sequence = Some(sequence);
            },
        }

        (verdict, events)
    }

    /// Report sources silent for at least the silence timeout and drop
    /// those silent for at least the forget period.
    ///
    /// Each silence is reported once; the next packet from that source
    /// reports it resumed. A forgotten source starts over as new.
    pub fn sweep(&mut self, now: Instant) -> Vec<RegistryEvent> {
        let RegistryConfig { silence_timeout, forget_after, .. } = self.config;
        let mut events = Vec::new();

        for (source, record) in &mut self.sources {
            let silent_for = now.saturating_duration_since(record.last_seen);
            if !record.silent && silent_for >= silence_timeout {
                record.silent = true;
                let event = RegistryEvent::PublisherSilent { source: *source, silent_for };
                events.push((*source, event));
            }
        }

        self.sources.retain(|source, record| {
            let silent_for = now.saturating_duration_since(record.last_seen);
            if silent_for < forget_after {
                return true;
            }
            let event = RegistryEvent::PublisherForgotten { source: *source, silent_for };
            events.push((*source, event));
            false
        });

        // Stable sort keeps silence ahead of forgetting for the same source.
        events.sort_by_key(|(source, _)| *source);
        events.into_iter().map(|(_, event)| event).collect()
    }

    /// Record for `source`.
    pub fn get(&self, source: &SourceIdentity) -> Option<&SourceRecord> {
        self.sources.get(source)
    }

    /// All known sources.
    pub fn sources(&self) -> impl Iterator<Item = (&SourceIdentity, &SourceRecord)> {
        self.sources.iter()
    }

    /// Number of known sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source has been heard yet.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
