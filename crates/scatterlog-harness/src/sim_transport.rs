//! Simulated datagram transport over turmoil UDP.
//!
//! Turmoil routes unicast datagrams between named hosts but has no notion of
//! a multicast group. [`SimTransport`] fills that gap: a sender socket that
//! targets a multicast address instead sends one copy to every member host
//! on the group's port. Members receive on a plain socket bound to that
//! port, which is what joining looks like from the receiving side.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use scatterlog_core::{DatagramSocket, Transport};
use tracing::trace;
use turmoil::net::UdpSocket;

/// Turmoil transport with explicit group membership.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    members: Vec<String>,
}

impl SimTransport {
    /// Transport whose group sends reach `members` (turmoil host names).
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { members: members.into_iter().map(Into::into).collect() }
    }

    /// Member host names.
    pub fn members(&self) -> &[String] {
        &self.members
    }
}

/// A turmoil UDP socket, optionally fanning group sends out to members.
pub struct SimSocket {
    inner: UdpSocket,
    fanout: Vec<IpAddr>,
}

impl SimSocket {
    async fn bind(addr: SocketAddr, fanout: Vec<IpAddr>) -> io::Result<Self> {
        Ok(Self { inner: UdpSocket::bind(addr).await?, fanout })
    }
}

impl fmt::Debug for SimSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimSocket")
            .field("local_addr", &self.inner.local_addr().ok())
            .field("fanout", &self.fanout)
            .finish()
    }
}

#[async_trait]
impl DatagramSocket for SimSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if !target.ip().is_multicast() {
            return self.inner.send_to(buf, target).await;
        }

        for member in &self.fanout {
            let copy_to = SocketAddr::new(*member, target.port());
            trace!(group = %target, member = %copy_to, len = buf.len(), "group fan-out");
            self.inner.send_to(buf, copy_to).await?;
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Socket = SimSocket;

    async fn join(&self, group: SocketAddr) -> io::Result<SimSocket> {
        SimSocket::bind(unspecified(group.port()), Vec::new()).await
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<SimSocket> {
        SimSocket::bind(addr, Vec::new()).await
    }

    async fn open_sender(&self, _group: SocketAddr) -> io::Result<SimSocket> {
        let fanout = self.members.iter().map(|host| turmoil::lookup(host.as_str())).collect();
        SimSocket::bind(unspecified(0), fanout).await
    }
}

fn unspecified(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}
