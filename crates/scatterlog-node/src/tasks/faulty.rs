//! Sockets that fail on cue, for exercising the failure paths of the tasks.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use scatterlog_core::{DatagramSocket, Transport};
use tokio::sync::broadcast;

use crate::NodeEvent;

/// Fails `recv_from` a set number of times, then waits forever.
#[derive(Debug)]
pub(crate) struct FaultySocket {
    recv_failures: AtomicU32,
}

impl FaultySocket {
    pub(crate) fn failing(times: u32) -> Self {
        Self { recv_failures: AtomicU32::new(times) }
    }

    pub(crate) fn healthy() -> Self {
        Self::failing(0)
    }
}

#[async_trait]
impl DatagramSocket for FaultySocket {
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let failed = self
            .recv_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        std::future::pending().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 7400)))
    }
}

/// Refuses `join` a set number of times, then hands out healthy sockets.
#[derive(Debug)]
pub(crate) struct FaultyTransport {
    join_failures: AtomicU32,
    joins: AtomicU32,
}

impl FaultyTransport {
    pub(crate) fn refusing_joins(times: u32) -> Self {
        Self { join_failures: AtomicU32::new(times), joins: AtomicU32::new(0) }
    }

    pub(crate) fn joins(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    type Socket = FaultySocket;

    async fn join(&self, _group: SocketAddr) -> io::Result<FaultySocket> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .join_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::from(io::ErrorKind::AddrNotAvailable));
        }
        Ok(FaultySocket::healthy())
    }

    async fn bind(&self, _addr: SocketAddr) -> io::Result<FaultySocket> {
        Ok(FaultySocket::healthy())
    }

    async fn open_sender(&self, _group: SocketAddr) -> io::Result<FaultySocket> {
        Ok(FaultySocket::healthy())
    }
}

/// Transport events seen within `window`, as `(operation, failures)` pairs.
///
/// `TransportError` shows up as `(operation, 0)` and `TransportFailed` as
/// `("failed", failures)`.
pub(crate) async fn transport_events(
    events: &mut broadcast::Receiver<NodeEvent>,
    window: Duration,
) -> Vec<(&'static str, u32)> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            NodeEvent::TransportError(error) => seen.push((error.operation, 0)),
            NodeEvent::TransportFailed { failures, .. } => seen.push(("failed", failures)),
            _ => {},
        }
    }
    seen
}
