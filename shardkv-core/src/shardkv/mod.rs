//! Sharded key/value storage groups
//!
//! Each group is a replicated participant serving the shards the controller
//! assigns to it. Shards change hands by a pull from the new owner followed
//! by a garbage-collection handshake with the old one:
//!
//! ```text
//!   old owner            new owner
//!   Serving              (absent)
//!     | ConfigChange       | ConfigChange
//!   BePulling  <--pull--  Pulling
//!     |                    | InstallShard
//!     |        <--gc----  GCing
//!   (released)             | GcShard
//!                         Serving
//! ```

pub mod client;
pub mod common;
mod migration;
mod reconfig;
pub mod server;
pub mod state_machine;

pub use client::Clerk;
pub use server::ShardKv;
pub use state_machine::GroupState;
