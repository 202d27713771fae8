//! The composition root.
//!
//! A [`Multicaster`] wires the sans-IO components to sockets and tasks for
//! whichever roles the configuration asks for:
//!
//! ```text
//!   publish() ──► sender task ──► group ──► receiver task ──► subscribe()
//!                     │                        │   ▲
//!                     ▼                        ▼   │ outcome
//!               key listener ◄──── unicast ─ requester tasks
//!                  task                     (one per missing key)
//! ```
//!
//! Everything that happens at runtime is also reported on [`Multicaster::events`].

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use scatterlog_core::{
    DatagramSocket, Environment, KeyCache, KeyListener, Receiver, Sender, Transport,
};
use scatterlog_crypto::{CipherSuite, CredentialScheme, KEY_SIZE, KeyMaterial};
use scatterlog_proto::{Epoch, Message, SourceIdentity};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinSet,
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{debug, info, warn};

use crate::{
    NodeConfig, NodeEvent, PublishError, SocketRole, StartError,
    request_client::RequestClient,
    tasks::{
        FailureBudget,
        listener::ListenerTask,
        receiver::ReceiverTask,
        sender::{PublisherCommand, SenderTask},
    },
};

/// Epoch a publisher starts in.
pub const FIRST_EPOCH: Epoch = 1;

/// Narrow seam for a logging facade: hand over one message, never block.
pub trait MessageSink: Send + Sync {
    /// Queue `message` for publication.
    ///
    /// # Errors
    ///
    /// The message could not be queued.
    fn emit(&self, message: Message) -> Result<(), PublishError>;
}

/// A running node.
///
/// Dropping it without [`Multicaster::shutdown`] aborts its tasks.
#[derive(Debug)]
pub struct Multicaster {
    group: SocketAddr,
    identity: Option<SourceIdentity>,
    commands: Option<mpsc::Sender<PublisherCommand>>,
    deliveries: Option<broadcast::Sender<Message>>,
    events: broadcast::Sender<NodeEvent>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Multicaster {
    /// Validate `config`, open every socket it needs and start the tasks.
    ///
    /// # Errors
    ///
    /// Invalid configuration or a socket that could not be opened. Nothing
    /// keeps running after an error.
    pub async fn start<E: Environment, T: Transport>(
        config: NodeConfig,
        env: E,
        transport: T,
        credentials: Arc<dyn CredentialScheme>,
        cipher: Arc<dyn CipherSuite>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let transport = Arc::new(transport);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_capacity);

        let mut node = Self {
            group: config.group,
            identity: None,
            commands: None,
            deliveries: None,
            events,
            shutdown,
            tasks: JoinSet::new(),
        };

        if let Some(publisher) = &config.publisher {
            let listen_socket =
                open(SocketRole::Listener, publisher.listen, transport.bind(publisher.listen).await)?;
            let bound = open(SocketRole::Listener, publisher.listen, listen_socket.local_addr())?;
            let send_socket =
                open(SocketRole::Sender, config.group, transport.open_sender(config.group).await)?;

            let endpoint = SocketAddr::new(publisher.advertised_ip(), bound.port());
            let source = SourceIdentity::new(endpoint, env.random_u64());
            let key = fresh_key(&env, publisher.key_lifetime.as_secs());

            let mut listener =
                KeyListener::new(source, publisher.listener.clone(), Arc::clone(&credentials));
            listener.install(FIRST_EPOCH, key.clone())?;
            let listener = Arc::new(Mutex::new(listener));

            let (commands, commands_rx) = mpsc::channel(publisher.queue_capacity);

            node.tasks.spawn(
                ListenerTask {
                    env: env.clone(),
                    socket: listen_socket,
                    listener: Arc::clone(&listener),
                    budget: FailureBudget::new(
                        SocketRole::Listener,
                        publisher.max_transport_failures,
                        publisher.retry_delay,
                    ),
                    events: node.events.clone(),
                    shutdown: shutdown_rx.clone(),
                }
                .run(),
            );
            node.tasks.spawn(
                SenderTask {
                    env: env.clone(),
                    socket: send_socket,
                    group: config.group,
                    sender: Sender::new(source, FIRST_EPOCH, key, env.now(), Arc::clone(&cipher)),
                    policy: Box::new(publisher.rotation.clone()),
                    key_lifetime: publisher.key_lifetime,
                    listener,
                    commands: commands_rx,
                    events: node.events.clone(),
                    shutdown: shutdown_rx.clone(),
                }
                .run(),
            );

            info!(%source, group = %config.group, "publisher started");
            node.identity = Some(source);
            node.commands = Some(commands);
        }

        if let Some(subscriber) = &config.subscriber {
            let group_socket =
                open(SocketRole::Receiver, config.group, transport.join(config.group).await)?;
            let request_socket = open(
                SocketRole::Requester,
                subscriber.request_bind,
                transport.bind(subscriber.request_bind).await,
            )?;

            let (client, demux) = RequestClient::spawn(
                env.clone(),
                request_socket,
                node.events.clone(),
                shutdown_rx.clone(),
                subscriber.max_transport_failures,
                subscriber.reconnect_delay,
            );
            node.tasks.spawn(async move {
                if let Err(e) = demux.await {
                    warn!(error = %e, "key request demux task failed");
                }
            });

            let (deliveries, _) = broadcast::channel(subscriber.delivery_capacity);
            let (outcomes_tx, outcomes) = mpsc::unbounded_channel();

            node.tasks.spawn(
                ReceiverTask {
                    env: env.clone(),
                    transport: Arc::clone(&transport),
                    socket: group_socket,
                    group: config.group,
                    config: subscriber.clone(),
                    receiver: Receiver::new(subscriber.receiver.clone(), Arc::clone(&cipher)),
                    cache: Arc::new(Mutex::new(KeyCache::new(subscriber.cache.clone()))),
                    client: Arc::new(client),
                    credentials: Arc::clone(&credentials),
                    requesters: JoinSet::new(),
                    outcomes_tx,
                    outcomes,
                    deliveries: deliveries.clone(),
                    events: node.events.clone(),
                    shutdown: shutdown_rx.clone(),
                }
                .run(),
            );

            info!(group = %config.group, "subscriber started");
            node.deliveries = Some(deliveries);
        }

        Ok(node)
    }

    /// Queue `message` for publication, waiting for room in the queue.
    ///
    /// # Errors
    ///
    /// `NotPublisher` without a publisher role, `Closed` after shutdown.
    pub async fn publish(&self, message: Message) -> Result<(), PublishError> {
        let commands = self.commands.as_ref().ok_or(PublishError::NotPublisher)?;
        commands.send(PublisherCommand::Publish(message)).await.map_err(|_| PublishError::Closed)
    }

    /// Queue `message` without waiting.
    ///
    /// # Errors
    ///
    /// As [`Multicaster::publish`], plus `QueueFull`.
    pub fn try_publish(&self, message: Message) -> Result<(), PublishError> {
        let commands = self.commands.as_ref().ok_or(PublishError::NotPublisher)?;
        commands.try_send(PublisherCommand::Publish(message)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Move the publisher to a new epoch now, regardless of the rotation
    /// policy. Messages queued before the call use the old epoch.
    ///
    /// # Errors
    ///
    /// `NotPublisher` without a publisher role, `Closed` after shutdown.
    pub async fn rotate_key(&self) -> Result<(), PublishError> {
        let commands = self.commands.as_ref().ok_or(PublishError::NotPublisher)?;
        commands.send(PublisherCommand::Rotate).await.map_err(|_| PublishError::Closed)
    }

    /// Stream of delivered messages, starting now. `None` without a
    /// subscriber role.
    ///
    /// The stream ends at shutdown. A subscription that falls behind skips
    /// the messages it missed.
    pub fn subscribe(&self) -> Option<Subscription> {
        self.deliveries.as_ref().map(|deliveries| Subscription::new(deliveries.subscribe()))
    }

    /// Node events, starting now.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Publisher identity, if publishing.
    pub fn identity(&self) -> Option<SourceIdentity> {
        self.identity
    }

    /// Multicast group.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Stop every task. Outstanding key requests are cancelled and packets
    /// waiting on them are dropped, not delivered. Open subscriptions end.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        self.commands = None;
        self.deliveries = None;

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                warn!(error = %e, "node task panicked");
            }
        }
        debug!(group = %self.group, "node shut down");
    }
}

impl MessageSink for Multicaster {
    fn emit(&self, message: Message) -> Result<(), PublishError> {
        self.try_publish(message)
    }
}

/// Delivered messages, as an async iterator.
///
/// Also a [`Stream`].
#[derive(Debug)]
pub struct Subscription {
    inner: BroadcastStream<Message>,
}

impl Subscription {
    fn new(receiver: broadcast::Receiver<Message>) -> Self {
        Self { inner: BroadcastStream::new(receiver) }
    }

    /// Next message, or `None` once the node has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        loop {
            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(message)) => return Poll::Ready(Some(message)),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "subscriber fell behind, messages skipped");
                },
                None => return Poll::Ready(None),
            }
        }
    }
}

fn open<S>(role: SocketRole, addr: SocketAddr, result: std::io::Result<S>) -> Result<S, StartError> {
    result.map_err(|source| StartError::Socket { role, addr, source })
}

fn fresh_key<E: Environment>(env: &E, lifetime_secs: u64) -> KeyMaterial {
    let mut secret = [0u8; KEY_SIZE];
    env.random_bytes(&mut secret);
    KeyMaterial::generate(secret, env.wall_clock(), lifetime_secs)
}
