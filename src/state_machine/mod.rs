//! State machine layer for Raft
//!
//! - `StateMachine`: the contract the applier drives
//! - `HashStateMachine`: folds applied values into a hash, used to compare
//!   replicas in tests

pub mod hash;
pub mod traits;

pub use hash::{encode_value, hash_values, HashState, HashStateMachine, SharedHashState, SnapshotStore};
pub use traits::{StateMachine, StateMachineError};
