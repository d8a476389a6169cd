//! State management with PostgreSQL persistence
//!
//! Transaction records are stored as JSONB snapshots so a restarted
//! coordinator can rehydrate its registry and resume pending receipts.

mod manager;

pub use manager::StateManager;
