//! Testing utilities for Raft cluster integration tests
//!
//! - `TestCluster`: in-process cluster of `RaftServer`s on an in-memory network
//! - `Simulation`: synchronous cluster of bare `Fsm`s with a seeded,
//!   lossy network and invariant checks after every step

pub mod cluster;
pub mod sim;

pub use cluster::{TestCluster, TestNode};
pub use sim::Simulation;
