//! Node configuration.
//!
//! A node joins one multicast group and plays one or both roles: publisher
//! (sender plus key listener) and subscriber (receiver plus key requesters).
//! Every knob has a default; the `with_*` methods override single fields.
//!
//! ```
//! use std::net::{Ipv4Addr, SocketAddr};
//!
//! use scatterlog_node::{NodeConfig, PublisherConfig, SubscriberConfig};
//!
//! let group = SocketAddr::from((Ipv4Addr::new(239, 255, 42, 1), 5140));
//! let listen = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 7), 0));
//!
//! let config = NodeConfig::new(group)
//!     .with_publisher(PublisherConfig::new(listen))
//!     .with_subscriber(SubscriberConfig::default());
//! assert!(config.validate().is_ok());
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use scatterlog_core::{
    CacheConfig, IntervalRotation, ListenerConfig, ReceiverConfig, RequesterConfig,
};

use crate::ConfigError;

/// Top-level node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Multicast group and port
    pub group: SocketAddr,
    /// Interface to join the group on and send from; `None` lets the OS pick
    pub interface: Option<IpAddr>,
    /// Multicast TTL (IPv4) or hop limit (IPv6)
    pub multicast_ttl: u32,
    /// Whether our own multicast packets loop back to local sockets
    pub multicast_loop: bool,
    /// Publisher role
    pub publisher: Option<PublisherConfig>,
    /// Subscriber role
    pub subscriber: Option<SubscriberConfig>,
    /// Capacity of the node event channel
    pub event_capacity: usize,
}

impl NodeConfig {
    /// Node on `group` with no roles yet.
    pub fn new(group: SocketAddr) -> Self {
        Self {
            group,
            interface: None,
            multicast_ttl: 1,
            multicast_loop: true,
            publisher: None,
            subscriber: None,
            event_capacity: 1024,
        }
    }

    /// Act as publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: PublisherConfig) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Act as subscriber.
    #[must_use]
    pub fn with_subscriber(mut self, subscriber: SubscriberConfig) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Join and send on `interface`.
    #[must_use]
    pub fn with_interface(mut self, interface: IpAddr) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Set the multicast TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    /// Enable or disable multicast loopback.
    #[must_use]
    pub fn with_loop(mut self, enabled: bool) -> Self {
        self.multicast_loop = enabled;
        self
    }

    /// Check for misconfiguration that would make the node useless.
    ///
    /// # Errors
    ///
    /// The first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.group.ip().is_multicast() {
            return Err(ConfigError::NotMulticast(self.group));
        }
        if self.group.port() == 0 {
            return Err(ConfigError::NoGroupPort);
        }
        if self.publisher.is_none() && self.subscriber.is_none() {
            return Err(ConfigError::NoRoles);
        }
        if self.multicast_ttl == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("event_capacity"));
        }
        if let Some(interface) = self.interface
            && (interface.is_multicast() || interface.is_ipv4() != self.group.is_ipv4())
        {
            return Err(ConfigError::InterfaceMismatch { interface, group: self.group });
        }
        if let Some(publisher) = &self.publisher {
            publisher.validate()?;
        }
        if let Some(subscriber) = &self.subscriber {
            subscriber.validate()?;
        }
        Ok(())
    }
}

/// Publisher role: sender and key listener.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Where the key listener binds. Port 0 picks one.
    pub listen: SocketAddr,
    /// Address receivers should send key requests to, if different from
    /// `listen`'s address. Required when `listen` is unspecified.
    pub advertise: Option<IpAddr>,
    /// Lifetime of each generated key
    pub key_lifetime: Duration,
    /// When to rotate
    pub rotation: IntervalRotation,
    /// Key listener settings
    pub listener: ListenerConfig,
    /// Messages buffered between `publish` and the sender task
    pub queue_capacity: usize,
    /// Consecutive listener socket failures before the listener gives up
    pub max_transport_failures: u32,
    /// First pause after a failed listener receive; doubles per failure
    pub retry_delay: Duration,
}

impl PublisherConfig {
    /// Publisher whose key listener binds `listen`.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            advertise: None,
            key_lifetime: Duration::from_secs(60 * 60),
            rotation: IntervalRotation::default(),
            listener: ListenerConfig::default(),
            queue_capacity: 1024,
            max_transport_failures: 5,
            retry_delay: Duration::from_millis(50),
        }
    }

    /// Advertise `address` as the key listener endpoint.
    #[must_use]
    pub fn with_advertise(mut self, address: IpAddr) -> Self {
        self.advertise = Some(address);
        self
    }

    /// Rotation policy.
    #[must_use]
    pub fn with_rotation(mut self, rotation: IntervalRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Key lifetime.
    #[must_use]
    pub fn with_key_lifetime(mut self, lifetime: Duration) -> Self {
        self.key_lifetime = lifetime;
        self
    }

    /// Address placed in the source identity.
    pub fn advertised_ip(&self) -> IpAddr {
        self.advertise.unwrap_or(self.listen.ip())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let advertised = self.advertised_ip();
        if advertised.is_unspecified() || advertised.is_multicast() {
            return Err(ConfigError::UnroutableAdvertise(advertised));
        }
        if self.rotation.interval.is_zero() {
            return Err(ConfigError::ZeroRotationInterval);
        }
        if self.key_lifetime <= self.rotation.interval {
            return Err(ConfigError::KeyLifetimeTooShort {
                lifetime: self.key_lifetime,
                interval: self.rotation.interval,
            });
        }
        if self.listener.retained_epochs == 0 {
            return Err(ConfigError::ZeroCapacity("retained_epochs"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("queue_capacity"));
        }
        if self.max_transport_failures == 0 {
            return Err(ConfigError::ZeroCapacity("max_transport_failures"));
        }
        Ok(())
    }
}

/// Subscriber role: receiver, key cache and key requesters.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Where the key request socket binds
    pub request_bind: SocketAddr,
    /// Key cache settings
    pub cache: CacheConfig,
    /// Retry and timeout settings for key requests
    pub requester: RequesterConfig,
    /// Receive pipeline settings
    pub receiver: ReceiverConfig,
    /// How often silence detection and cache expiry run
    pub sweep_interval: Duration,
    /// Consecutive socket failures before the receiver or the key request
    /// demux gives up
    pub max_transport_failures: u32,
    /// First delay before reopening a failed group socket or retrying the
    /// request socket; doubles per failure
    pub reconnect_delay: Duration,
    /// Capacity of the delivered-message channel
    pub delivery_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            request_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            cache: CacheConfig::default(),
            requester: RequesterConfig::default(),
            receiver: ReceiverConfig::default(),
            sweep_interval: Duration::from_secs(1),
            max_transport_failures: 5,
            reconnect_delay: Duration::from_millis(100),
            delivery_capacity: 1024,
        }
    }
}

impl SubscriberConfig {
    /// Key request retry settings.
    #[must_use]
    pub fn with_requester(mut self, requester: RequesterConfig) -> Self {
        self.requester = requester;
        self
    }

    /// Key cache settings.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Bind the key request socket to `addr`.
    #[must_use]
    pub fn with_request_bind(mut self, addr: SocketAddr) -> Self {
        self.request_bind = addr;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let requester = &self.requester;
        if requester.request_timeout.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if requester.base_backoff > requester.max_backoff {
            return Err(ConfigError::InvalidBackoff {
                base: requester.base_backoff,
                max: requester.max_backoff,
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        let registry = &self.receiver.registry;
        if registry.forget_after < registry.silence_timeout {
            return Err(ConfigError::ForgetBeforeSilence {
                silence_timeout: registry.silence_timeout,
                forget_after: registry.forget_after,
            });
        }
        if self.cache.max_waiters == 0 {
            return Err(ConfigError::ZeroCapacity("max_waiters"));
        }
        if self.max_transport_failures == 0 {
            return Err(ConfigError::ZeroCapacity("max_transport_failures"));
        }
        if self.delivery_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("delivery_capacity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    fn group() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(239, 1, 2, 3), 5140))
    }

    fn publisher() -> PublisherConfig {
        PublisherConfig::new(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7400)))
    }

    #[test]
    fn publisher_and_subscriber_is_valid() {
        let config = NodeConfig::new(group())
            .with_publisher(publisher())
            .with_subscriber(SubscriberConfig::default());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn sources_are_not_forgotten_before_reported_silent() {
        let mut subscriber = SubscriberConfig::default();
        subscriber.receiver.registry.silence_timeout = Duration::from_secs(60);
        subscriber.receiver.registry.forget_after = Duration::from_secs(30);

        let config = NodeConfig::new(group()).with_subscriber(subscriber);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ForgetBeforeSilence {
                silence_timeout: Duration::from_secs(60),
                forget_after: Duration::from_secs(30),
            })
        );
    }

    #[test]
    fn unicast_group_is_rejected() {
        let addr = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 5140));
        let config = NodeConfig::new(addr).with_subscriber(SubscriberConfig::default());
        assert_eq!(config.validate(), Err(ConfigError::NotMulticast(addr)));
    }

    #[test]
    fn node_without_roles_is_rejected() {
        assert_eq!(NodeConfig::new(group()).validate(), Err(ConfigError::NoRoles));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = NodeConfig::new(group()).with_publisher(publisher()).with_ttl(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTtl));
    }

    #[test]
    fn unspecified_listener_needs_advertise_address() {
        let wildcard = PublisherConfig::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 7400)));
        let config = NodeConfig::new(group()).with_publisher(wildcard.clone());
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnroutableAdvertise(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
        );

        let fixed = wildcard.with_advertise(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)));
        assert_eq!(NodeConfig::new(group()).with_publisher(fixed).validate(), Ok(()));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let requester = RequesterConfig {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..RequesterConfig::default()
        };
        let config = NodeConfig::new(group())
            .with_subscriber(SubscriberConfig::default().with_requester(requester));
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBackoff {
                base: Duration::from_secs(10),
                max: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn key_must_outlive_rotation_interval() {
        let short = publisher().with_key_lifetime(Duration::from_secs(60));
        let config = NodeConfig::new(group()).with_publisher(short);
        assert!(matches!(config.validate(), Err(ConfigError::KeyLifetimeTooShort { .. })));
    }

    #[test]
    fn interface_family_must_match_group() {
        let config = NodeConfig::new(group())
            .with_subscriber(SubscriberConfig::default())
            .with_interface(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(matches!(config.validate(), Err(ConfigError::InterfaceMismatch { .. })));
    }
}
