//! Node error types.
//!
//! Only [`ConfigError`] and [`StartError`] are fatal, and only to the caller
//! of [`crate::Multicaster::start`]. Everything that goes wrong once the node
//! is running is reported as a [`crate::NodeEvent`] and logged.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use scatterlog_core::ListenerError;
use thiserror::Error;

/// Invalid configuration, detected before anything is bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Group address is not a multicast address
    #[error("{0} is not a multicast address")]
    NotMulticast(SocketAddr),

    /// Group port is zero
    #[error("multicast group needs a port")]
    NoGroupPort,

    /// Neither publisher nor subscriber configured
    #[error("node has neither publisher nor subscriber role")]
    NoRoles,

    /// TTL of zero never leaves the host
    #[error("multicast TTL must be at least 1")]
    ZeroTtl,

    /// Interface address cannot carry the group
    #[error("interface {interface} cannot carry group {group}")]
    InterfaceMismatch {
        /// Configured interface
        interface: IpAddr,
        /// Configured group
        group: SocketAddr,
    },

    /// Receivers could not reach the key listener at this address
    #[error("key listener advertise address {0} is not routable")]
    UnroutableAdvertise(IpAddr),

    /// Rotation interval of zero
    #[error("rotation interval must be non-zero")]
    ZeroRotationInterval,

    /// Keys would expire before the sender rotates away from them
    #[error("key lifetime {lifetime:?} must exceed rotation interval {interval:?}")]
    KeyLifetimeTooShort {
        /// Configured key lifetime
        lifetime: Duration,
        /// Configured rotation interval
        interval: Duration,
    },

    /// Request timeout of zero
    #[error("key request timeout must be non-zero")]
    ZeroRequestTimeout,

    /// Base backoff above the cap
    #[error("base backoff {base:?} exceeds max backoff {max:?}")]
    InvalidBackoff {
        /// Configured base
        base: Duration,
        /// Configured cap
        max: Duration,
    },

    /// Sweep interval of zero
    #[error("sweep interval must be non-zero")]
    ZeroSweepInterval,

    /// Sources would be forgotten before they are reported silent
    #[error("forget period {forget_after:?} is shorter than silence timeout {silence_timeout:?}")]
    ForgetBeforeSilence {
        /// Configured silence timeout
        silence_timeout: Duration,
        /// Configured forget period
        forget_after: Duration,
    },

    /// A capacity or count that must be positive is zero
    #[error("{0} must be non-zero")]
    ZeroCapacity(&'static str),
}

/// Which socket a failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    /// Multicast group socket of the receiver
    Receiver,
    /// Multicast send socket of the sender
    Sender,
    /// Unicast socket of the key listener
    Listener,
    /// Unicast socket for key requests
    Requester,
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Receiver => "receiver",
            Self::Sender => "sender",
            Self::Listener => "listener",
            Self::Requester => "requester",
        };
        f.write_str(name)
    }
}

/// The node could not start.
#[derive(Debug, Error)]
pub enum StartError {
    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A socket could not be opened
    #[error("failed to open {role} socket on {addr}: {source}")]
    Socket {
        /// Socket that failed
        role: SocketRole,
        /// Address it was opened on
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Initial key could not be installed
    #[error("failed to install initial key: {0}")]
    Listener(#[from] ListenerError),
}

/// A message or command could not be queued for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Node has no publisher role
    #[error("node is not a publisher")]
    NotPublisher,

    /// Sender queue is full
    #[error("publish queue is full")]
    QueueFull,

    /// Node is shutting down
    #[error("node is shut down")]
    Closed,
}

/// Socket I/O failed while running.
///
/// Carries the error kind and text rather than the [`io::Error`] itself so
/// that it can travel on the broadcast event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{role} socket {operation} failed: {message}")]
pub struct TransportError {
    /// Socket that failed
    pub role: SocketRole,
    /// What was being done
    pub operation: &'static str,
    /// Error kind
    pub kind: io::ErrorKind,
    /// Error text
    pub message: String,
}

impl TransportError {
    /// Wrap an I/O error.
    pub fn new(role: SocketRole, operation: &'static str, error: &io::Error) -> Self {
        Self { role, operation, kind: error.kind(), message: error.to_string() }
    }
}

/// Waiting for a key exchange reply failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// Nothing arrived in time
    #[error("timed out waiting for reply")]
    Timeout,

    /// Request client stopped
    #[error("request client closed")]
    Closed,
}
