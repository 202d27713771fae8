//! Receiver task: reads the group socket, runs the receive pipeline and
//! owns the requester tasks it starts.
//!
//! Requester tasks report back over a channel and the outcome is applied
//! here, so the source registry is only ever touched by this task. A packet
//! that misses the cache parks in the cache and the loop moves on to the
//! next datagram.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use scatterlog_core::{
    DatagramSocket, DiscardReason, Environment, FailureReason, KeyCache, KeyId, KeyRequester,
    PendingPacket, Receiver, ReceiverAction, RegistryEvent, Transport,
};
use scatterlog_crypto::CredentialScheme;
use scatterlog_proto::{MAX_DATAGRAM_SIZE, Message, Sequence};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, info, trace, warn};

use super::{
    FailureBudget, emit,
    requester::{KeyOutcome, RequesterTask},
};
use crate::{NodeEvent, SecurityKind, SocketRole, SubscriberConfig, request_client::RequestClient};

pub(crate) struct ReceiverTask<E: Environment, T: Transport> {
    pub(crate) env: E,
    pub(crate) transport: Arc<T>,
    pub(crate) socket: T::Socket,
    pub(crate) group: SocketAddr,
    pub(crate) config: SubscriberConfig,
    pub(crate) receiver: Receiver,
    pub(crate) cache: Arc<Mutex<KeyCache<PendingPacket>>>,
    pub(crate) client: Arc<RequestClient<E, T::Socket>>,
    pub(crate) credentials: Arc<dyn CredentialScheme>,
    pub(crate) requesters: JoinSet<()>,
    pub(crate) outcomes_tx: mpsc::UnboundedSender<KeyOutcome>,
    pub(crate) outcomes: mpsc::UnboundedReceiver<KeyOutcome>,
    pub(crate) deliveries: broadcast::Sender<Message>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<E: Environment, T: Transport> ReceiverTask<E, T> {
    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut budget = FailureBudget::new(
            SocketRole::Receiver,
            self.config.max_transport_failures,
            self.config.reconnect_delay,
        );
        let mut next_sweep = self.env.now() + self.config.sweep_interval;

        loop {
            let until_sweep = next_sweep.saturating_duration_since(self.env.now());

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(outcome) = self.outcomes.recv() => self.key_outcome(outcome),
                Some(_) = self.requesters.join_next(), if !self.requesters.is_empty() => {},
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        budget.succeeded();
                        trace!(%peer, len, "datagram on group socket");
                        self.datagram(&buf[..len]);
                    },
                    Err(e) => {
                        let Some(delay) = budget.failed("receive", &e, &self.events) else {
                            break;
                        };
                        if !self.rejoin(delay, &mut budget).await {
                            break;
                        }
                    },
                },
                () = self.env.sleep(until_sweep) => {
                    self.sweep();
                    next_sweep = self.env.now() + self.config.sweep_interval;
                },
            }
        }

        self.stop().await;
    }

    fn datagram(&mut self, datagram: &[u8]) {
        let now = self.env.now();
        let wall = self.env.wall_clock();
        let actions = {
            let mut cache = self.cache.lock();
            self.receiver.handle_datagram(datagram, self.group, &mut cache, now, wall)
        };
        self.apply(actions);
    }

    fn key_outcome(&mut self, outcome: KeyOutcome) {
        let KeyOutcome { id, attempts, result } = outcome;
        let finished = result.as_ref().map(|_| ()).map_err(|reason| *reason);

        match finished {
            Ok(()) => info!(key = %id, attempts, "key installed"),
            Err(FailureReason::AuthRejected) => {
                warn!(security = true, key = %id, attempts, "listener rejected our credential");
                emit(
                    &self.events,
                    NodeEvent::SecurityEvent {
                        peer: Some(id.source.endpoint),
                        kind: SecurityKind::CredentialRefused { key: id },
                    },
                );
            },
            Err(reason) => warn!(key = %id, attempts, %reason, "key request failed"),
        }
        emit(&self.events, NodeEvent::KeyRequestFinished { key: id, attempts, outcome: finished });

        let now = self.env.now();
        let actions = {
            let mut cache = self.cache.lock();
            match result {
                Ok(key) => self.receiver.handle_key_ready(id, key, &mut cache, now),
                Err(reason) => self.receiver.handle_key_failed(id, reason, &mut cache, now),
            }
        };
        self.apply(actions);
    }

    fn sweep(&mut self) {
        let now = self.env.now();
        let wall = self.env.wall_clock();
        let actions = {
            let mut cache = self.cache.lock();
            self.receiver.sweep(&mut cache, now, wall)
        };
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<ReceiverAction>) {
        for action in actions {
            match action {
                ReceiverAction::Deliver(delivery) => {
                    if delivery.gap > 0 {
                        debug!(
                            source = %delivery.source,
                            epoch = delivery.epoch,
                            sequence = delivery.sequence,
                            gap = delivery.gap,
                            "sequence gap"
                        );
                    }
                    emit(
                        &self.events,
                        NodeEvent::Delivered {
                            source: delivery.source,
                            epoch: delivery.epoch,
                            sequence: delivery.sequence,
                            gap: delivery.gap,
                            epoch_start: delivery.epoch_start,
                        },
                    );
                    let _ = self.deliveries.send(delivery.message);
                },
                ReceiverAction::RequestKey(id) => self.spawn_requester(id),
                ReceiverAction::Discard { key, sequence, reason } => {
                    self.discarded(key, sequence, reason);
                },
                ReceiverAction::Registry(event) => {
                    log_registry_event(&event);
                    emit(&self.events, event.into());
                },
            }
        }
    }

    fn discarded(&self, key: Option<KeyId>, sequence: Option<Sequence>, reason: DiscardReason) {
        if reason.is_security_relevant() {
            warn!(security = true, ?key, ?sequence, %reason, "discarded packet");
        } else {
            debug!(?key, ?sequence, %reason, "discarded packet");
        }

        if let (DiscardReason::AuthenticationFailed, Some(key), Some(sequence)) =
            (reason, key, sequence)
        {
            emit(
                &self.events,
                NodeEvent::SecurityEvent {
                    peer: None,
                    kind: SecurityKind::PacketForged { key, sequence },
                },
            );
        }
        emit(&self.events, NodeEvent::Dropped { key, sequence, reason });
    }

    fn spawn_requester(&mut self, id: KeyId) {
        debug!(key = %id, endpoint = %id.source.endpoint, "requesting key");
        emit(&self.events, NodeEvent::KeyRequestStarted { key: id });

        let fsm = KeyRequester::new(
            id,
            self.env.random_u64(),
            self.config.requester.clone(),
            Arc::clone(&self.credentials),
        );
        let task = RequesterTask {
            env: self.env.clone(),
            fsm,
            client: Arc::clone(&self.client),
            cache: Arc::clone(&self.cache),
            outcomes: self.outcomes_tx.clone(),
            events: self.events.clone(),
        };
        self.requesters.spawn(task.run());
    }

    /// Reopen the group socket after a receive failure, waiting `delay`
    /// first and doubling it after each failed join. Returns `false` once
    /// the failure budget is spent or shutdown was requested.
    async fn rejoin(&mut self, mut delay: Duration, budget: &mut FailureBudget) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return false,
                () = self.env.sleep(delay) => {},
            }

            match self.transport.join(self.group).await {
                Ok(socket) => {
                    let failures = budget.failures();
                    info!(group = %self.group, failures, "rejoined multicast group");
                    self.socket = socket;
                    return true;
                },
                Err(e) => match budget.failed("join", &e, &self.events) {
                    Some(next) => delay = next,
                    None => return false,
                },
            }
        }
    }

    /// Cancel outstanding requests and release their waiters undelivered.
    async fn stop(mut self) {
        self.requesters.shutdown().await;

        let actions = {
            let mut cache = self.cache.lock();
            self.receiver.cancel(&mut cache)
        };
        let cancelled = actions.len();
        self.apply(actions);

        debug!(group = %self.group, cancelled, "receiver stopped");
    }
}

fn log_registry_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::NewSource { source, group } => {
            info!(%source, %group, "discovered publisher");
        },
        RegistryEvent::EpochRotated { source, from, to } => {
            debug!(%source, from, to, "publisher rotated epoch");
        },
        RegistryEvent::PublisherSilent { source, silent_for } => {
            info!(%source, ?silent_for, "publisher silent");
        },
        RegistryEvent::PublisherResumed { source, silent_for } => {
            info!(%source, ?silent_for, "publisher resumed");
        },
        RegistryEvent::PublisherForgotten { source, silent_for } => {
            info!(%source, ?silent_for, "forgot publisher");
        },
    }
}
