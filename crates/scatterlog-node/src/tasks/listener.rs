//! Key listener task: answers key requests on the publisher's unicast socket.

use std::sync::Arc;

use parking_lot::Mutex;
use scatterlog_core::{DatagramSocket, Environment, KeyId, KeyListener};
use scatterlog_proto::{KeyExchange, KeyReplyStatus, MAX_DATAGRAM_SIZE};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use super::{FailureBudget, emit};
use crate::{NodeEvent, SecurityKind, SocketRole, TransportError};

pub(crate) struct ListenerTask<E, S> {
    pub(crate) env: E,
    pub(crate) socket: S,
    pub(crate) listener: Arc<Mutex<KeyListener>>,
    pub(crate) budget: FailureBudget,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<E: Environment, S: DatagramSocket> ListenerTask<E, S> {
    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, peer)) => {
                    self.budget.succeeded();
                    self.serve(&buf[..len], peer).await;
                },
                Err(e) => {
                    let Some(delay) = self.budget.failed("receive", &e, &self.events) else {
                        break;
                    };
                    tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => break,
                        () = self.env.sleep(delay) => {},
                    }
                },
            }
        }

        debug!("key listener stopped");
    }

    async fn serve(&self, datagram: &[u8], peer: std::net::SocketAddr) {
        let wall = self.env.wall_clock();
        let handled = self.listener.lock().handle_datagram(datagram, wall);

        let (request, reply) = match handled {
            Ok(handled) => handled,
            Err(e) => {
                debug!(%peer, error = %e, "ignoring key exchange datagram");
                return;
            },
        };

        let key = KeyId::new(request.source, request.epoch);
        match &reply.status {
            KeyReplyStatus::Granted(_) => debug!(%peer, %key, "granted key"),
            KeyReplyStatus::UnknownEpoch => debug!(%peer, %key, "epoch not served"),
            KeyReplyStatus::AuthFailed => {
                warn!(security = true, %peer, %key, "key request with bad credential");
                emit(
                    &self.events,
                    NodeEvent::SecurityEvent {
                        peer: Some(peer),
                        kind: SecurityKind::RequestCredentialRejected { key },
                    },
                );
            },
        }

        let bytes = match KeyExchange::Reply(reply).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, %key, error = %e, "failed to encode key reply");
                return;
            },
        };

        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            let error = TransportError::new(SocketRole::Listener, "send", &e);
            warn!(%peer, %error, "key reply send failed");
            emit(&self.events, NodeEvent::TransportError(error));
        } else {
            trace!(%peer, len = bytes.len(), "sent key reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use scatterlog_core::{ListenerConfig, SystemEnv};
    use scatterlog_crypto::SharedSecret;
    use scatterlog_proto::SourceIdentity;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::tasks::faulty::{FaultySocket, transport_events};

    fn start(
        recv_failures: u32,
        max_failures: u32,
    ) -> (JoinHandle<()>, broadcast::Receiver<NodeEvent>, watch::Sender<bool>) {
        let identity = SourceIdentity::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 7400)), 1);
        let credentials = Arc::new(SharedSecret::new(b"listener task secret".to_vec()).unwrap());
        let listener = KeyListener::new(identity, ListenerConfig::default(), credentials);
        let (events, events_rx) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = ListenerTask {
            env: SystemEnv,
            socket: FaultySocket::failing(recv_failures),
            listener: Arc::new(Mutex::new(listener)),
            budget: FailureBudget::new(
                SocketRole::Listener,
                max_failures,
                Duration::from_millis(1),
            ),
            events,
            shutdown: shutdown_rx,
        };
        (tokio::spawn(task.run()), events_rx, shutdown)
    }

    #[tokio::test]
    async fn persistent_receive_failure_stops_the_listener() {
        let (mut task, mut events, _shutdown) = start(u32::MAX, 3);

        tokio::time::timeout(Duration::from_secs(5), &mut task).await.unwrap().unwrap();

        let seen = transport_events(&mut events, Duration::from_millis(50)).await;
        assert_eq!(seen, [("receive", 0), ("receive", 0), ("receive", 0), ("failed", 3)]);
    }

    #[tokio::test]
    async fn transient_receive_failures_are_tolerated() {
        let (task, mut events, shutdown) = start(2, 3);

        let seen = transport_events(&mut events, Duration::from_millis(200)).await;
        assert_eq!(seen, [("receive", 0), ("receive", 0)]);
        assert!(!task.is_finished());

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
