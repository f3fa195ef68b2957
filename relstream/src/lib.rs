//! RelStream -- reliable, ordered byte streams over an unreliable datagram
//! channel.
//!
//! Each connection pairs a local application stream with a remote peer:
//! - **Sending**: application bytes are cut into checksummed data packets,
//!   kept in flight under a fixed sliding window and retransmitted on timeout
//! - **Receiving**: packets are reordered, deduplicated and delivered in
//!   sequence, honouring the application's backpressure
//! - **Teardown**: a connection is destroyed once both directions have
//!   signalled end-of-stream and every byte is acknowledged and delivered

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod transport;

// Re-export key public types at crate root.
pub use config::Config;
pub use connection::{Connection, ConnectionStats, Lifecycle};
pub use endpoint::Endpoint;
pub use error::{RelStreamError, Result};
pub use packet::Packet;
pub use registry::{ConnectionId, Registry};
pub use scheduler::{Reaped, Scheduler, TickReport};
pub use store::SegmentStore;
pub use transport::{AppStream, Channel, ReadOutcome};
