//! Scatterlog node runtime
//!
//! Runs the sans-IO state machines from `scatterlog-core` on tokio: one task
//! per socket, one task per outstanding key request, and channels between
//! them. A [`Multicaster`] is the entry point; it publishes, subscribes or
//! both, depending on its [`NodeConfig`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scatterlog_core::SystemEnv;
//! use scatterlog_crypto::{SharedSecret, XChaCha20Poly1305Suite};
//! use scatterlog_node::{Multicaster, NodeConfig, PublisherConfig, UdpTransport};
//! use scatterlog_proto::{Facility, Message, Severity};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::new("239.1.2.3:7400".parse()?)
//!     .with_publisher(PublisherConfig::new("0.0.0.0:7401".parse()?));
//! let transport = UdpTransport::from_config(&config);
//!
//! let node = Multicaster::start(
//!     config,
//!     SystemEnv,
//!     transport,
//!     Arc::new(SharedSecret::new(b"correct horse battery staple".to_vec())?),
//!     Arc::new(XChaCha20Poly1305Suite),
//! )
//! .await?;
//!
//! node.publish(Message::new(Facility::Daemon, Severity::Notice, "started")).await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`multicaster`]: Composition root, publish and subscribe API
//! - [`config`]: Node, publisher and subscriber configuration
//! - [`udp`]: Real UDP multicast transport
//! - [`request_client`]: Shared unicast socket for key requests
//! - [`event`]: Observable node events
//! - [`error`]: Startup, publish and transport errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod multicaster;
pub mod request_client;
mod tasks;
pub mod udp;

pub use config::{NodeConfig, PublisherConfig, SubscriberConfig};
pub use error::{ConfigError, PollError, PublishError, SocketRole, StartError, TransportError};
pub use event::{NodeEvent, SecurityKind};
pub use multicaster::{FIRST_EPOCH, MessageSink, Multicaster, Subscription};
pub use request_client::{RequestClient, RequestHandle};
pub use udp::{UdpSocket, UdpTransport};
