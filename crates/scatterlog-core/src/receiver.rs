//! Subscriber side: the per-packet pipeline.
//!
//! ```text
//! datagram ─> decode ─> registry.observe ─> precheck ─> cache lookup
//!                                                         │
//!                        ┌──── hit ───────────────────────┤
//!                        ↓                                │ miss
//!                 open + authenticate                     ↓
//!                        │                      queue behind await_key
//!                        ↓                      (RequestKey on first miss)
//!                registry.accept ─> Deliver / Duplicate / Stale
//! ```
//!
//! A miss never blocks anything else: the packet is parked on the cache
//! entry for its (source, epoch) and the caller moves on. When the key
//! arrives, [`Receiver::handle_key_ready`] runs the parked packets in arrival
//! order. When the request fails, [`Receiver::handle_key_failed`] discards
//! them.
//!
//! Authentication failures are hard discards, never retried with another
//! key. Sequence numbers only count once the packet authenticated; the
//! precheck may drop known replays early but never records anything.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use scatterlog_crypto::{CipherSuite, KeyMaterial};
use scatterlog_proto::{Epoch, Message, MessagePacket, Sequence, SourceIdentity};

use crate::{
    CodecError, DiscardReason, codec,
    key_cache::{AwaitOutcome, KeyCache, KeyId, Lookup, QueueRejection},
    registry::{RegistryConfig, RegistryEvent, SourceRegistry},
    requester::FailureReason,
    sequence::WindowVerdict,
};

/// Receiver tuning.
#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    /// Source registry settings
    pub registry: RegistryConfig,
}

/// A framed packet parked until its key arrives.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    packet: MessagePacket,
    group: SocketAddr,
    received_at: Instant,
}

impl PendingPacket {
    /// The parked packet.
    pub fn packet(&self) -> &MessagePacket {
        &self.packet
    }

    /// When it arrived.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

/// A delivered message with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Publisher
    pub source: SourceIdentity,
    /// Group the packet arrived on
    pub group: SocketAddr,
    /// Key epoch
    pub epoch: Epoch,
    /// Sequence within the epoch
    pub sequence: Sequence,
    /// Sequence numbers skipped just before this one
    pub gap: u32,
    /// Packet carried `EPOCH_START`
    pub epoch_start: bool,
    /// The message
    pub message: Message,
}

/// Actions for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Hand this message to subscribers
    Deliver(Delivery),
    /// First miss on this key: start a requester for it
    RequestKey(KeyId),
    /// Packet dropped
    Discard {
        /// Key the packet referenced, if it framed
        key: Option<KeyId>,
        /// Sequence number, if it framed
        sequence: Option<Sequence>,
        /// Why
        reason: DiscardReason,
    },
    /// Something the registry noticed
    Registry(RegistryEvent),
}

impl ReceiverAction {
    fn discard(packet: &MessagePacket, reason: DiscardReason) -> Self {
        Self::Discard {
            key: Some(KeyId::new(packet.source(), packet.epoch())),
            sequence: Some(packet.sequence()),
            reason,
        }
    }
}

/// Receive pipeline for one subscriber.
///
/// The key cache is passed into each call rather than owned, since the
/// runtime shares it with requester tasks.
#[derive(Debug)]
pub struct Receiver {
    registry: SourceRegistry,
    suite: Arc<dyn CipherSuite>,
}

impl Receiver {
    /// Receiver using `suite` to open packets.
    pub fn new(config: ReceiverConfig, suite: Arc<dyn CipherSuite>) -> Self {
        Self { registry: SourceRegistry::new(config.registry), suite }
    }

    /// Source registry.
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Process one datagram received on `group`.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        group: SocketAddr,
        cache: &mut KeyCache<PendingPacket>,
        now: Instant,
        wall: u64,
    ) -> Vec<ReceiverAction> {
        let packet = match codec::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                return vec![ReceiverAction::Discard {
                    key: None,
                    sequence: None,
                    reason: DiscardReason::Malformed(e),
                }];
            },
        };

        let source = packet.source();
        let id = KeyId::new(source, packet.epoch());

        let mut actions: Vec<ReceiverAction> = self
            .registry
            .observe(source, now)
            .into_iter()
            .map(ReceiverAction::Registry)
            .collect();

        match self.registry.precheck(&source, packet.epoch(), packet.sequence()) {
            WindowVerdict::Duplicate => {
                actions.push(ReceiverAction::discard(&packet, DiscardReason::Duplicate));
                return actions;
            },
            WindowVerdict::Stale => {
                actions.push(ReceiverAction::discard(&packet, DiscardReason::Stale));
                return actions;
            },
            WindowVerdict::Accepted { .. } => {},
        }

        if let Lookup::Hit(key) = cache.lookup(&id, wall) {
            actions.extend(self.finish(&packet, group, &key, now));
            return actions;
        }

        let pending = PendingPacket { packet, group, received_at: now };
        match cache.await_key(id, pending, now, wall) {
            AwaitOutcome::Ready(key, pending) => {
                actions.extend(self.finish(&pending.packet, pending.group, &key, now));
            },
            AwaitOutcome::Queued => {},
            AwaitOutcome::Started => actions.push(ReceiverAction::RequestKey(id)),
            AwaitOutcome::Rejected(pending, QueueRejection::QueueFull) => {
                actions.push(ReceiverAction::discard(&pending.packet, DiscardReason::QueueFull));
            },
            AwaitOutcome::Rejected(pending, QueueRejection::Failed(reason)) => {
                actions.push(ReceiverAction::discard(
                    &pending.packet,
                    DiscardReason::KeyUnavailable(reason),
                ));
            },
        }
        actions
    }

    /// Install a fetched key and run every packet parked on it, in arrival
    /// order.
    pub fn handle_key_ready(
        &mut self,
        id: KeyId,
        key: KeyMaterial,
        cache: &mut KeyCache<PendingPacket>,
        now: Instant,
    ) -> Vec<ReceiverAction> {
        let waiters = cache.complete(id, key.clone());
        waiters
            .into_iter()
            .flat_map(|pending| self.finish(&pending.packet, pending.group, &key, now))
            .collect()
    }

    /// Record a failed request and discard every packet parked on it.
    pub fn handle_key_failed(
        &mut self,
        id: KeyId,
        reason: FailureReason,
        cache: &mut KeyCache<PendingPacket>,
        now: Instant,
    ) -> Vec<ReceiverAction> {
        cache
            .fail(id, reason, now)
            .into_iter()
            .map(|pending| {
                ReceiverAction::discard(&pending.packet, DiscardReason::KeyUnavailable(reason))
            })
            .collect()
    }

    /// Periodic housekeeping: silence detection, forgetting long-silent
    /// sources and cache expiry.
    pub fn sweep(
        &mut self,
        cache: &mut KeyCache<PendingPacket>,
        now: Instant,
        wall: u64,
    ) -> Vec<ReceiverAction> {
        cache.sweep(now, wall);
        self.registry.sweep(now).into_iter().map(ReceiverAction::Registry).collect()
    }

    /// Drop every parked packet. Used at shutdown; nothing is delivered.
    pub fn cancel(&mut self, cache: &mut KeyCache<PendingPacket>) -> Vec<ReceiverAction> {
        cache
            .cancel_all()
            .into_iter()
            .flat_map(|(_, waiters)| waiters)
            .map(|pending| {
                ReceiverAction::discard(
                    &pending.packet,
                    DiscardReason::KeyUnavailable(FailureReason::Cancelled),
                )
            })
            .collect()
    }

    fn finish(
        &mut self,
        packet: &MessagePacket,
        group: SocketAddr,
        key: &KeyMaterial,
        now: Instant,
    ) -> Vec<ReceiverAction> {
        let opened = match codec::open(packet, key, self.suite.as_ref()) {
            Ok(opened) => opened,
            Err(e) => {
                let reason = match e {
                    CodecError::Frame(frame) => DiscardReason::Malformed(frame),
                    CodecError::Payload(_) => DiscardReason::Undecodable,
                    CodecError::Crypto(_) => DiscardReason::AuthenticationFailed,
                };
                return vec![ReceiverAction::discard(packet, reason)];
            },
        };

        let (verdict, events) =
            self.registry.accept(opened.source, group, opened.epoch, opened.sequence, now);
        let mut actions: Vec<ReceiverAction> =
            events.into_iter().map(ReceiverAction::Registry).collect();

        match verdict {
            WindowVerdict::Accepted { gap } => actions.push(ReceiverAction::Deliver(Delivery {
                source: opened.source,
                group,
                epoch: opened.epoch,
                sequence: opened.sequence,
                gap,
                epoch_start: opened.flags.is_epoch_start(),
                message: opened.message,
            })),
            WindowVerdict::Duplicate => {
                actions.push(ReceiverAction::discard(packet, DiscardReason::Duplicate));
            },
            WindowVerdict::Stale => {
                actions.push(ReceiverAction::discard(packet, DiscardReason::Stale));
            },
        }
        actions
    }
}
