//! Publisher side: sequence numbering and key rotation.
//!
//! A [`Sender`] holds the process's current (epoch, key) and the next
//! sequence number. Sequence numbers start at 1 in every epoch and never
//! repeat within one, which is what makes the derived AEAD nonces unique.
//!
//! Rotation is triggered from outside. A [`RotationPolicy`] says when; the
//! runtime generates the key, installs it in the key listener and calls
//! [`Sender::rotate`]. Packets already sent under the old epoch stay
//! decryptable for as long as the listener serves it.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use scatterlog_crypto::{CipherSuite, KeyMaterial};
use scatterlog_proto::{Epoch, Message, MessagePacket, PacketFlags, Sequence, SourceIdentity};

use crate::{SendError, codec};

/// Decides when the sender should move to a new epoch.
pub trait RotationPolicy: Send + Sync + fmt::Debug {
    /// Whether to rotate now, given when the current epoch started and how
    /// many messages it has carried.
    fn should_rotate(&self, epoch_started: Instant, sent_in_epoch: u64, now: Instant) -> bool;

    /// Earliest time a time-based rotation could become due.
    fn next_due(&self, epoch_started: Instant) -> Option<Instant>;
}

/// Rotate after a fixed interval or a message count, whichever comes first.
#[derive(Debug, Clone)]
pub struct IntervalRotation {
    /// Maximum epoch age
    pub interval: Duration,
    /// Maximum messages per epoch, if bounded
    pub max_messages: Option<u64>,
}

impl Default for IntervalRotation {
    fn default() -> Self {
        Self { interval: Duration::from_secs(15 * 60), max_messages: None }
    }
}

impl RotationPolicy for IntervalRotation {
    fn should_rotate(&self, epoch_started: Instant, sent_in_epoch: u64, now: Instant) -> bool {
        now.saturating_duration_since(epoch_started) >= self.interval
            || self.max_messages.is_some_and(|max| sent_in_epoch >= max)
    }

    fn next_due(&self, epoch_started: Instant) -> Option<Instant> {
        epoch_started.checked_add(self.interval)
    }
}

/// Publisher state for one identity.
#[derive(Debug, Clone)]
pub struct Sender {
    identity: SourceIdentity,
    epoch: Epoch,
    key: KeyMaterial,
    next_sequence: Option<Sequence>,
    epoch_started: Instant,
    sent_in_epoch: u64,
    suite: Arc<dyn CipherSuite>,
}

impl Sender {
    /// Sender starting at `epoch` with `key`.
    pub fn new(
        identity: SourceIdentity,
        epoch: Epoch,
        key: KeyMaterial,
        now: Instant,
        suite: Arc<dyn CipherSuite>,
    ) -> Self {
        Self {
            identity,
            epoch,
            key,
            next_sequence: Some(1),
            epoch_started: now,
            sent_in_epoch: 0,
            suite,
        }
    }

    /// Encrypt and frame `message` with the next sequence number.
    ///
    /// The first packet of each epoch carries `EPOCH_START`.
    ///
    /// # Errors
    ///
    /// `SequenceExhausted` once every sequence number of the epoch has been
    /// used; `Codec` if the message does not fit in a datagram. A failed
    /// call consumes no sequence number.
    pub fn seal(&mut self, message: &Message) -> Result<MessagePacket, SendError> {
        let Some(sequence) = self.next_sequence else {
            return Err(SendError::SequenceExhausted { epoch: self.epoch });
        };

        let flags = if sequence == 1 { PacketFlags::EPOCH_START } else { PacketFlags::empty() };
        let packet = codec::seal(
            message,
            &self.identity,
            &self.key,
            self.epoch,
            sequence,
            flags,
            self.suite.as_ref(),
        )?;

        self.next_sequence = sequence.checked_add(1);
        self.sent_in_epoch += 1;
        Ok(packet)
    }

    /// Move to `epoch` with `key`. Sequence numbering restarts at 1.
    ///
    /// # Errors
    ///
    /// `EpochNotAdvanced` unless `epoch` is higher than the current one.
    pub fn rotate(&mut self, epoch: Epoch, key: KeyMaterial, now: Instant) -> Result<(), SendError> {
        if epoch <= self.epoch {
            return Err(SendError::EpochNotAdvanced { current: self.epoch, requested: epoch });
        }
        self.epoch = epoch;
        self.key = key;
        self.next_sequence = Some(1);
        self.epoch_started = now;
        self.sent_in_epoch = 0;
        Ok(())
    }

    /// Whether `policy` asks for a rotation at `now`. Always true once the
    /// sequence space is exhausted.
    pub fn should_rotate(&self, policy: &dyn RotationPolicy, now: Instant) -> bool {
        self.next_sequence.is_none()
            || policy.should_rotate(self.epoch_started, self.sent_in_epoch, now)
    }

    /// Epoch to rotate to next.
    pub fn next_epoch(&self) -> Option<Epoch> {
        self.epoch.checked_add(1)
    }

    /// Publisher identity.
    pub fn identity(&self) -> SourceIdentity {
        self.identity
    }

    /// Current epoch.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Current key.
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// When the current epoch started.
    pub fn epoch_started(&self) -> Instant {
        self.epoch_started
    }

    /// Messages sealed in the current epoch.
    pub fn sent_in_epoch(&self) -> u64 {
        self.sent_in_epoch
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> Option<Sequence> {
        self.next_sequence
    }
}
