//! Node events for observability collaborators.

use std::{net::SocketAddr, time::Duration};

use scatterlog_core::{DiscardReason, FailureReason, GrantRejection, KeyId, RegistryEvent};
use scatterlog_proto::{Epoch, Sequence, SourceIdentity};

use crate::{SocketRole, TransportError};

/// Something happened inside a running node.
///
/// Broadcast on [`crate::Multicaster::events`]. Slow consumers lag and lose
/// events; nothing inside the node waits on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// First authenticated packet from a publisher
    PublisherDiscovered {
        /// Publisher
        source: SourceIdentity,
        /// Group it was heard on
        group: SocketAddr,
    },
    /// Publisher not heard from within the silence timeout
    PublisherSilent {
        /// Publisher
        source: SourceIdentity,
        /// Time since last packet
        silent_for: Duration,
    },
    /// A silent publisher was heard again
    PublisherResumed {
        /// Publisher
        source: SourceIdentity,
        /// How long it was silent
        silent_for: Duration,
    },
    /// A publisher was silent so long that its record was dropped
    PublisherForgotten {
        /// Publisher
        source: SourceIdentity,
        /// How long it was silent
        silent_for: Duration,
    },
    /// A publisher's newest authenticated epoch moved forward
    EpochRotated {
        /// Publisher
        source: SourceIdentity,
        /// Previous epoch
        from: Epoch,
        /// New epoch
        to: Epoch,
    },
    /// A message was handed to subscribers
    Delivered {
        /// Publisher
        source: SourceIdentity,
        /// Key epoch
        epoch: Epoch,
        /// Sequence number
        sequence: Sequence,
        /// Sequence numbers skipped just before this one
        gap: u32,
        /// First packet of its epoch
        epoch_start: bool,
    },
    /// A packet was not delivered
    Dropped {
        /// Key it referenced, if it framed
        key: Option<KeyId>,
        /// Sequence number, if it framed
        sequence: Option<Sequence>,
        /// Why
        reason: DiscardReason,
    },
    /// Something that may indicate an attack
    SecurityEvent {
        /// Remote peer, when known
        peer: Option<SocketAddr>,
        /// What happened
        kind: SecurityKind,
    },
    /// A key request was started for a cache miss
    KeyRequestStarted {
        /// Key being fetched
        key: KeyId,
    },
    /// A key request finished
    KeyRequestFinished {
        /// Key that was fetched
        key: KeyId,
        /// Attempts sent
        attempts: u32,
        /// `Ok` if the key was installed
        outcome: Result<(), FailureReason>,
    },
    /// This node's publisher moved to a new epoch
    KeyRotated {
        /// New epoch
        epoch: Epoch,
        /// Epochs no longer served
        retired: Vec<Epoch>,
    },
    /// Socket I/O failed; the node carries on
    TransportError(TransportError),
    /// A socket failed repeatedly and its task stopped
    TransportFailed {
        /// Socket that failed
        role: SocketRole,
        /// Consecutive failures
        failures: u32,
    },
}

/// Kind of [`NodeEvent::SecurityEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityKind {
    /// A multicast packet failed authentication
    PacketForged {
        /// Key the packet claimed
        key: KeyId,
        /// Sequence number it claimed
        sequence: Sequence,
    },
    /// A key request to our listener carried a bad credential
    RequestCredentialRejected {
        /// Key that was asked for
        key: KeyId,
    },
    /// A listener rejected our credential
    CredentialRefused {
        /// Key we asked for
        key: KeyId,
    },
    /// A granted reply did not check out
    GrantRejected {
        /// Key we asked for
        key: KeyId,
        /// What was wrong
        reason: GrantRejection,
    },
}

impl From<RegistryEvent> for NodeEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::NewSource { source, group } => Self::PublisherDiscovered { source, group },
            RegistryEvent::EpochRotated { source, from, to } => {
                Self::EpochRotated { source, from, to }
            },
            RegistryEvent::PublisherSilent { source, silent_for } => {
                Self::PublisherSilent { source, silent_for }
            },
            RegistryEvent::PublisherResumed { source, silent_for } => {
                Self::PublisherResumed { source, silent_for }
            },
            RegistryEvent::PublisherForgotten { source, silent_for } => {
                Self::PublisherForgotten { source, silent_for }
            },
        }
    }
}
