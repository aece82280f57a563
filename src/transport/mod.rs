//! Transport layer for Raft RPC communication
//!
//! - `InMemoryNetwork`: channel-based network for tests, with partitions
//!   and seeded packet loss

pub mod inmemory;
pub mod traits;

pub use inmemory::{InMemoryNetwork, InMemoryTransport, NodeHandle};
pub use traits::{Transport, TransportError};
