//! UDP multicast transport over real sockets.
//!
//! Group sockets are built with socket2 so that `SO_REUSEADDR` can be set
//! before binding (several receivers on one host share the group port) and
//! group membership can be joined on a chosen interface. The finished socket
//! is handed to tokio.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use async_trait::async_trait;
use scatterlog_core::{DatagramSocket, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::NodeConfig;

/// Real UDP sockets with IP multicast.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    interface: Option<IpAddr>,
    interface_index: u32,
    ttl: u32,
    multicast_loop: bool,
}

impl UdpTransport {
    /// Transport joining groups on `interface` (OS default when `None`).
    pub fn new(interface: Option<IpAddr>, ttl: u32, multicast_loop: bool) -> Self {
        Self { interface, interface_index: 0, ttl, multicast_loop }
    }

    /// Transport with the interface, TTL and loopback settings of `config`.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.interface, config.multicast_ttl, config.multicast_loop)
    }

    /// IPv6 interface index for joining and sending. IPv6 membership is
    /// keyed by index rather than address; 0 lets the OS pick.
    #[must_use]
    pub fn with_interface_index(mut self, index: u32) -> Self {
        self.interface_index = index;
        self
    }

    fn interface_v4(&self) -> Ipv4Addr {
        match self.interface {
            Some(IpAddr::V4(interface)) => interface,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// A tokio UDP socket.
#[derive(Debug)]
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
}

impl UdpSocket {
    fn from_socket2(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let inner = tokio::net::UdpSocket::from_std(socket.into())?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    type Socket = UdpSocket;

    async fn join(&self, group: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        match group.ip() {
            IpAddr::V4(addr) => {
                socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
                socket.join_multicast_v4(&addr, &self.interface_v4())?;
            },
            IpAddr::V6(addr) => {
                socket.set_only_v6(true)?;
                socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, group.port())).into())?;
                socket.join_multicast_v6(&addr, self.interface_index)?;
            },
        }

        debug!(%group, interface = ?self.interface, "joined multicast group");
        UdpSocket::from_socket2(socket)
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let inner = tokio::net::UdpSocket::bind(addr).await?;
        Ok(UdpSocket { inner })
    }

    async fn open_sender(&self, group: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;

        match group.ip() {
            IpAddr::V4(_) => {
                let interface = self.interface_v4();
                socket.set_multicast_ttl_v4(self.ttl)?;
                socket.set_multicast_loop_v4(self.multicast_loop)?;
                if !interface.is_unspecified() {
                    socket.set_multicast_if_v4(&interface)?;
                }
                socket.bind(&SocketAddr::from((interface, 0)).into())?;
            },
            IpAddr::V6(_) => {
                socket.set_only_v6(true)?;
                socket.set_multicast_hops_v6(self.ttl)?;
                socket.set_multicast_loop_v6(self.multicast_loop)?;
                if self.interface_index != 0 {
                    socket.set_multicast_if_v6(self.interface_index)?;
                }
                socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
            },
        }

        UdpSocket::from_socket2(socket)
    }
}
