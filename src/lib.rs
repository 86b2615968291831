//! # chainstore
//!
//! Per-node storage and chain-replication engine backing one shard of a
//! distributed, schema-aware key-value store.
//!
//! ## Architecture
//!
//! - `types`: attribute value model and the data-type validation/predicate
//!   interface
//! - `codec`: on-disk key layout and attribute/object encodings
//! - `worker`: the cooperative background-thread framework shared by every
//!   maintenance subsystem
//! - `datalayer`: the durable store — objects, secondary indices,
//!   checkpoints, and the background checkpointer/indexer/wiper
//! - `idgen`: per-region monotonic version counters and the collected-range
//!   tracker the retransmitter uses to close gaps
//! - `index`: secondary-index diffing and range/iterator plumbing
//! - `keystate`: per-key pipeline state shared between replication and
//!   state transfer
//! - `replication`: the chain-replication manager
//! - `transfer`: the state-transfer protocol
//! - `wire`: message encode/decode for the inter-node protocol
//! - `bus`, `coordinator`: the external collaborator seams (message
//!   delivery, cluster configuration) this engine is built against but does
//!   not itself implement

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

/// Identifier newtypes used throughout the engine.
pub mod ids;

pub mod bus;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod datalayer;
pub mod error;
pub mod idgen;
pub mod index;
pub mod keystate;
pub mod replication;
pub mod transfer;
pub mod types;
pub mod wire;
pub mod worker;

pub use config::EngineConfig;
pub use daemon::Daemon;
pub use error::{EngineError, EngineResult};

/// Re-export of the crate version, as reported to peers during the
/// transfer handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
