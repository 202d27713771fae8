//! Deterministic simulation harness for Scatterlog.
//!
//! Turmoil-based implementations of the Environment and Transport traits so
//! whole nodes can run under simulated time with injected loss, latency and
//! partitions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_transport::{SimSocket, SimTransport};
