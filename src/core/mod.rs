//! Raft protocol core
//!
//! - `fsm`: deterministic protocol state machine, no I/O
//! - `log`: in-memory replicated log
//! - `progress`: leader-side replication tracking and vote tallies
//! - `server`: async driver wiring the FSM to storage, transport and the
//!   user state machine

pub mod config;
pub mod error;
pub mod fsm;
pub mod log;
pub mod message;
pub mod progress;
pub mod server;
pub mod types;

pub use config::RaftConfig;
pub use error::RaftError;
pub use fsm::{Fsm, FsmOutput, Role, SnapshotOutput};
pub use server::{Proposal, RaftServer, WaitType};
