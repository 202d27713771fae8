//! Requester task: drives one key request state machine over the shared
//! request client.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use scatterlog_core::{
    DatagramSocket, Environment, FailureReason, GrantRejection, KeyCache, KeyId, KeyRequester,
    PendingPacket, RequesterAction,
};
use scatterlog_crypto::KeyMaterial;
use scatterlog_proto::KeyExchange;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::emit;
use crate::{
    NodeEvent, PollError, SecurityKind,
    request_client::{RequestClient, RequestHandle},
};

/// How a requester task ended, reported back to the receiver task.
#[derive(Debug)]
pub(crate) struct KeyOutcome {
    pub(crate) id: KeyId,
    pub(crate) attempts: u32,
    pub(crate) result: Result<KeyMaterial, FailureReason>,
}

pub(crate) struct RequesterTask<E: Environment, S: DatagramSocket> {
    pub(crate) env: E,
    pub(crate) fsm: KeyRequester,
    pub(crate) client: Arc<RequestClient<E, S>>,
    pub(crate) cache: Arc<Mutex<KeyCache<PendingPacket>>>,
    pub(crate) outcomes: mpsc::UnboundedSender<KeyOutcome>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
}

impl<E: Environment, S: DatagramSocket> RequesterTask<E, S> {
    /// Run until the state machine finishes. Cancellation is by aborting
    /// the task; the receiver task releases the waiters itself then.
    pub(crate) async fn run(mut self) {
        let id = self.fsm.id();
        let mut handle: Option<RequestHandle> = None;

        let mut pending = match self.fsm.start(self.env.now()) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(key = %id, error = %e, "requester did not start");
                return;
            },
        };

        let mut attempts = 0u32;
        loop {
            let mut outcome = None;
            for action in std::mem::take(&mut pending) {
                match action {
                    RequesterAction::Send { endpoint, request } => {
                        attempts += 1;
                        self.send(&mut handle, endpoint, request.nonce, KeyExchange::Request(request))
                            .await;
                    },
                    RequesterAction::Installed(key) => outcome = Some(Ok(key)),
                    RequesterAction::GaveUp(reason) => outcome = Some(Err(reason)),
                    RequesterAction::Rejected { nonce, reason } => self.rejected(id, nonce, reason),
                }
            }

            if let Some(result) = outcome {
                let _ = self.outcomes.send(KeyOutcome { id, attempts, result });
                return;
            }

            let Some(deadline) = self.fsm.next_deadline() else {
                return;
            };
            self.cache.lock().note_progress(&id, self.fsm.attempts(), Some(deadline));

            let wait = deadline.saturating_duration_since(self.env.now());
            let reply = self.wait(&mut handle, wait).await;
            pending = match reply {
                Ok(bytes) => match KeyExchange::decode(&bytes) {
                    Ok(KeyExchange::Reply(reply)) => self.fsm.handle_reply(&reply, self.env.wall_clock()),
                    Ok(KeyExchange::Request(_)) | Err(_) => {
                        debug!(key = %id, "ignoring undecodable key reply");
                        Vec::new()
                    },
                },
                Err(PollError::Timeout) => self.fsm.tick(self.env.now()),
                Err(PollError::Closed) => self.fsm.cancel(),
            };
        }
    }

    async fn send(
        &self,
        handle: &mut Option<RequestHandle>,
        endpoint: std::net::SocketAddr,
        nonce: u64,
        request: KeyExchange,
    ) {
        let key = self.fsm.id();
        let bytes = match request.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%key, error = %e, "failed to encode key request");
                return;
            },
        };

        let sent = if let Some(existing) = handle.as_mut() {
            self.client.resend(existing, nonce, &bytes).await
        } else {
            match self.client.send_request(endpoint, nonce, &bytes).await {
                Ok(registered) => {
                    *handle = Some(registered);
                    Ok(())
                },
                Err(error) => Err(error),
            }
        };

        match sent {
            Ok(()) => trace!(%key, %endpoint, nonce, attempt = self.fsm.attempts(), "sent key request"),
            Err(error) => {
                warn!(%key, %endpoint, %error, "key request send failed");
                emit(&self.events, NodeEvent::TransportError(error));
            },
        }
    }

    /// Wait for a reply until `timeout`. Without a registered handle (the
    /// first send failed) there is nothing to wait on but the clock.
    async fn wait(
        &self,
        handle: &mut Option<RequestHandle>,
        timeout: Duration,
    ) -> Result<bytes::Bytes, PollError> {
        match handle {
            Some(handle) => self.client.poll_reply(handle, timeout).await,
            None => {
                self.env.sleep(timeout).await;
                Err(PollError::Timeout)
            },
        }
    }

    fn rejected(&self, key: KeyId, nonce: u64, reason: GrantRejection) {
        match reason {
            GrantRejection::Unsealable | GrantRejection::Malformed => {
                warn!(security = true, %key, nonce, %reason, "rejected key grant");
                emit(
                    &self.events,
                    NodeEvent::SecurityEvent {
                        peer: Some(key.source.endpoint),
                        kind: SecurityKind::GrantRejected { key, reason },
                    },
                );
            },
            GrantRejection::WrongEpoch { .. } | GrantRejection::Expired { .. } => {
                warn!(%key, nonce, %reason, "ignoring unusable key grant");
            },
        }
    }
}
