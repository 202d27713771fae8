//! Sender task: seals published messages, sends them to the group and
//! rotates the publisher key.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use scatterlog_core::{DatagramSocket, Environment, KeyListener, RotationPolicy, Sender};
use scatterlog_crypto::{KEY_SIZE, KeyMaterial};
use scatterlog_proto::Message;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::emit;
use crate::{NodeEvent, SocketRole, TransportError};

/// Work queued for the sender task.
#[derive(Debug)]
pub(crate) enum PublisherCommand {
    Publish(Message),
    Rotate,
}

pub(crate) struct SenderTask<E, S> {
    pub(crate) env: E,
    pub(crate) socket: S,
    pub(crate) group: SocketAddr,
    pub(crate) sender: Sender,
    pub(crate) policy: Box<dyn RotationPolicy>,
    pub(crate) key_lifetime: Duration,
    pub(crate) listener: Arc<Mutex<KeyListener>>,
    pub(crate) commands: mpsc::Receiver<PublisherCommand>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<E: Environment, S: DatagramSocket> SenderTask<E, S> {
    pub(crate) async fn run(mut self) {
        let mut timer_enabled = true;

        loop {
            let wait = self
                .policy
                .next_due(self.sender.epoch_started())
                .filter(|_| timer_enabled)
                .map(|due| due.saturating_duration_since(self.env.now()));

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(PublisherCommand::Publish(message)) => self.publish(&message).await,
                    Some(PublisherCommand::Rotate) => {
                        self.rotate();
                    },
                    None => break,
                },
                () = self.env.sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    let now = self.env.now();
                    if self.sender.should_rotate(self.policy.as_ref(), now) {
                        timer_enabled = self.rotate();
                    }
                },
            }
        }

        debug!(epoch = self.sender.epoch(), "sender stopped");
    }

    async fn publish(&mut self, message: &Message) {
        if self.sender.should_rotate(self.policy.as_ref(), self.env.now()) {
            self.rotate();
        }

        let packet = match self.sender.seal(message) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(epoch = self.sender.epoch(), error = %e, "dropping message that could not be sealed");
                return;
            },
        };

        let bytes = packet.to_vec();
        match self.socket.send_to(&bytes, self.group).await {
            Ok(_) => trace!(
                epoch = packet.epoch(),
                sequence = packet.sequence(),
                len = bytes.len(),
                "published message"
            ),
            Err(e) => {
                let error = TransportError::new(SocketRole::Sender, "send", &e);
                warn!(group = %self.group, %error, "multicast send failed, message dropped");
                emit(&self.events, NodeEvent::TransportError(error));
            },
        }
    }

    /// Move to a fresh epoch. The listener learns the key before any packet
    /// uses it. Returns whether the rotation happened.
    fn rotate(&mut self) -> bool {
        let Some(epoch) = self.sender.next_epoch() else {
            error!(epoch = self.sender.epoch(), "epoch numbers exhausted, cannot rotate");
            return false;
        };

        let mut secret = [0u8; KEY_SIZE];
        self.env.random_bytes(&mut secret);
        let wall = self.env.wall_clock();
        let key = KeyMaterial::generate(secret, wall, self.key_lifetime.as_secs());

        let installed = {
            let mut listener = self.listener.lock();
            listener.install(epoch, key.clone()).map(|mut retired| {
                retired.extend(listener.sweep(wall));
                retired
            })
        };
        let retired = match installed {
            Ok(retired) => retired,
            Err(e) => {
                warn!(epoch, error = %e, "key listener refused new epoch");
                return false;
            },
        };

        if let Err(e) = self.sender.rotate(epoch, key, self.env.now()) {
            warn!(epoch, error = %e, "sender refused new epoch");
            return false;
        }

        info!(epoch, ?retired, "rotated publisher key");
        emit(&self.events, NodeEvent::KeyRotated { epoch, retired });
        true
    }
}
