//! Coordination of transaction lifecycles
//!
//! The coordination engine:
//! 1. Serialises every state transition through one dispatch queue
//! 2. Forwards applied actions to per-transaction channels and the action bus
//! 3. Starts send sagas for ready transactions
//! 4. Lets grouped workflows sequence dependent steps

pub mod engine;
pub mod group;

pub use engine::{CoordinationEngine, Dispatcher};
pub use group::{GroupCoordinator, GroupStep};
