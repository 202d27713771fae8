//! Key request client transport.
//!
//! One unicast socket carries the key requests of every active requester.
//! A demux task reads replies and routes each to the handle that registered
//! its nonce, using the fixed key exchange prefix so no body is parsed here.
//! Correlation and timeouts are all this layer does; retries and backoff
//! belong to the requester state machine.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use scatterlog_core::{DatagramSocket, Environment};
use scatterlog_proto::{ExchangeKind, MAX_DATAGRAM_SIZE, peek_nonce};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{NodeEvent, PollError, SocketRole, TransportError, tasks::FailureBudget};

/// Replies buffered per handle before further ones are dropped.
const REPLY_BUFFER: usize = 4;

type Routes = HashMap<u64, mpsc::Sender<Bytes>>;

/// Shared request socket with nonce-based reply routing.
pub struct RequestClient<E: Environment, S: DatagramSocket> {
    env: E,
    socket: Arc<S>,
    routes: Arc<Mutex<Routes>>,
}

/// One outstanding request, possibly sent several times under different
/// nonces. Dropping it unregisters every nonce.
#[derive(Debug)]
pub struct RequestHandle {
    endpoint: SocketAddr,
    nonces: Vec<u64>,
    replies: mpsc::Receiver<Bytes>,
    sender: mpsc::WeakSender<Bytes>,
    routes: Arc<Mutex<Routes>>,
}

impl RequestHandle {
    /// Listener the request goes to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Nonces registered so far, in send order.
    pub fn nonces(&self) -> &[u64] {
        &self.nonces
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        let mut routes = self.routes.lock();
        for nonce in &self.nonces {
            routes.remove(nonce);
        }
    }
}

impl<E: Environment, S: DatagramSocket> RequestClient<E, S> {
    /// Start the demux task on `socket`. It stops when `shutdown` fires, or
    /// after `max_failures` consecutive receive failures spaced by a delay
    /// starting at `retry_delay` and doubling. Once it stops every open
    /// handle polls as [`PollError::Closed`].
    pub fn spawn(
        env: E,
        socket: S,
        events: broadcast::Sender<NodeEvent>,
        shutdown: watch::Receiver<bool>,
        max_failures: u32,
        retry_delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let socket = Arc::new(socket);
        let routes = Arc::new(Mutex::new(Routes::new()));
        let budget = FailureBudget::new(SocketRole::Requester, max_failures, retry_delay);

        let task = tokio::spawn(demux(
            env.clone(),
            Arc::clone(&socket),
            Arc::clone(&routes),
            budget,
            events,
            shutdown,
        ));

        (Self { env, socket, routes }, task)
    }

    /// Register `nonce` and send `datagram` to `endpoint`.
    ///
    /// # Errors
    ///
    /// The send failed. Nothing stays registered.
    pub async fn send_request(
        &self,
        endpoint: SocketAddr,
        nonce: u64,
        datagram: &[u8],
    ) -> Result<RequestHandle, TransportError> {
        let (tx, replies) = mpsc::channel(REPLY_BUFFER);
        let sender = tx.downgrade();
        self.routes.lock().insert(nonce, tx);

        let handle = RequestHandle {
            endpoint,
            nonces: vec![nonce],
            replies,
            sender,
            routes: Arc::clone(&self.routes),
        };
        self.send(endpoint, datagram).await?;
        Ok(handle)
    }

    /// Send a retry under a new `nonce`. Replies to earlier nonces of the
    /// same handle are still routed to it.
    ///
    /// # Errors
    ///
    /// The send failed. The nonce stays registered.
    pub async fn resend(
        &self,
        handle: &mut RequestHandle,
        nonce: u64,
        datagram: &[u8],
    ) -> Result<(), TransportError> {
        if let Some(tx) = handle.sender.upgrade() {
            self.routes.lock().insert(nonce, tx);
            handle.nonces.push(nonce);
        }
        self.send(handle.endpoint, datagram).await
    }

    /// Wait up to `timeout` for the next reply routed to `handle`.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived, `Closed` once the client has stopped.
    pub async fn poll_reply(
        &self,
        handle: &mut RequestHandle,
        timeout: Duration,
    ) -> Result<Bytes, PollError> {
        tokio::select! {
            reply = handle.replies.recv() => reply.ok_or(PollError::Closed),
            () = self.env.sleep(timeout) => Err(PollError::Timeout),
        }
    }

    /// Address of the request socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Nonces currently registered.
    pub fn registered(&self) -> usize {
        self.routes.lock().len()
    }

    async fn send(&self, endpoint: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(datagram, endpoint)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::new(SocketRole::Requester, "send", &e))
    }
}

async fn demux<E: Environment, S: DatagramSocket>(
    env: E,
    socket: Arc<S>,
    routes: Arc<Mutex<Routes>>,
    mut budget: FailureBudget,
    events: broadcast::Sender<NodeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => {
                budget.succeeded();
                received
            },
            Err(e) => {
                let Some(delay) = budget.failed("receive", &e, &events) else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    () = env.sleep(delay) => {},
                }
                continue;
            },
        };

        let datagram = &buf[..len];
        let Some((ExchangeKind::Reply, nonce)) = peek_nonce(datagram) else {
            trace!(%peer, len, "ignoring datagram that is not a key reply");
            continue;
        };

        let route = routes.lock().get(&nonce).cloned();
        match route {
            Some(tx) => {
                if tx.try_send(Bytes::copy_from_slice(datagram)).is_err() {
                    debug!(%peer, nonce, "reply buffer full, dropping reply");
                }
            },
            None => trace!(%peer, nonce, "reply for unknown nonce"),
        }
    }

    routes.lock().clear();
    debug!("key request demux stopped");
}
