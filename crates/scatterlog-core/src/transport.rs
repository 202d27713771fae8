//! Transport abstraction for datagram protocols.
//!
//! Abstracts over UDP with IP multicast. Production uses real sockets via
//! socket2 and tokio, tests use turmoil's simulated UDP with group
//! membership emulated by fan-out.
//!
//! Everything above this layer treats a socket as "send bytes to an address,
//! receive bytes with their sender". Group membership is decided once, when
//! the socket is opened.

use std::{io, net::SocketAddr};

use async_trait::async_trait;

/// A bound datagram socket.
///
/// Shared between tasks behind an `Arc`; both directions take `&self`.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to `target` (a unicast endpoint or a group).
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram. Blocks until one arrives.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens sockets for the three roles a node needs.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Socket type produced.
    type Socket: DatagramSocket;

    /// Socket that receives datagrams sent to multicast `group`.
    ///
    /// Binds the group's port and joins the group. Several sockets on one
    /// host may join the same group.
    async fn join(&self, group: SocketAddr) -> io::Result<Self::Socket>;

    /// Plain unicast socket bound to `addr`. Used for the key listener and
    /// for key requests (port 0 picks an ephemeral port).
    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Socket>;

    /// Socket for sending to multicast `group`, with the transport's TTL and
    /// loopback settings applied.
    async fn open_sender(&self, group: SocketAddr) -> io::Result<Self::Socket>;
}
