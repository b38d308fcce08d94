//! Shard controller
//!
//! A replicated participant that owns the config history. `Join`, `Leave`
//! and `Move` each derive config `n + 1` from config `n`; `Query` reads the
//! history. All four go through the controller's log so every replica
//! answers from the same state.

pub mod client;
pub mod common;
pub mod rebalance;
pub mod server;
pub mod state_machine;

pub use client::CtrlerClerk;
pub use server::ShardCtrler;
pub use state_machine::CtrlerState;
