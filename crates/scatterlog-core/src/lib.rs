//! Scatterlog protocol core logic
//!
//! Pure state machine logic for secure multicast log delivery, decoupled from
//! I/O. Nothing in this crate opens a socket, spawns a task or reads a clock.
//!
//! # Architecture
//!
//! Each component is a deterministic state machine. Callers pass the current
//! time in (`now` as a monotonic [`std::time::Instant`], `wall` as unix
//! seconds for key validity) and get back declarative actions describing
//! what should happen next: send this request, deliver this message, discard
//! that packet. A runtime or test harness executes the actions.
//!
//! The same code therefore runs unchanged under the tokio runtime in
//! `scatterlog-node`, in plain unit tests and in turmoil simulations with
//! injected loss and delay.
//!
//! # Components
//!
//! - [`codec`]: Seal and open message packets
//! - [`sequence`]: Per-(source, epoch) duplicate and gap tracking
//! - [`registry`]: Known publishers, epoch rotation and silence detection
//! - [`key_cache`]: Keys by (source, epoch) with in-flight request dedup
//! - [`requester`]: Key request retry/backoff state machine
//! - [`listener`]: Serves a publisher's own key history
//! - [`sender`]: Publisher side: sequence numbering and key rotation
//! - [`receiver`]: Subscriber side: the per-packet pipeline
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`transport`]: Datagram transport abstraction
//! - [`error`]: Error and discard taxonomy

pub mod codec;
pub mod env;
pub mod error;
pub mod key_cache;
pub mod listener;
pub mod receiver;
pub mod registry;
pub mod requester;
pub mod sender;
pub mod sequence;
pub mod transport;

pub use codec::{OpenedPacket, open, seal};
pub use env::{Environment, SystemEnv};
pub use error::{CodecError, DiscardReason, ListenerError, RequesterError, SendError};
pub use key_cache::{
    AwaitOutcome, CacheConfig, KeyCache, KeyId, Lookup, PendingRequest, QueueRejection,
};
pub use listener::{KeyListener, ListenerConfig};
pub use receiver::{Delivery, PendingPacket, Receiver, ReceiverAction, ReceiverConfig};
pub use registry::{RegistryConfig, RegistryEvent, SourceRecord, SourceRegistry};
pub use requester::{
    FailureReason, GrantRejection, KeyRequester, RequesterAction, RequesterConfig, RequesterState,
};
pub use sender::{IntervalRotation, RotationPolicy, Sender};
pub use sequence::{SequenceWindow, WindowVerdict};
pub use transport::{DatagramSocket, Transport};

const _: () = assert!(scatterlog_crypto::TAG_SIZE == scatterlog_proto::TAG_SIZE);
