//! Engine-wide configuration.
//!
//! Construction of this struct from flags/files/env is an out-of-scope CLI
//! concern (spec.md §1); callers (the `main.rs` binary, or a test) build it
//! directly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory the embedded store opens its files in.
    pub data_dir: PathBuf,

    /// This node's identity, once known. `None` until the saved instance
    /// state is loaded or the coordinator assigns one.
    pub server_id: Option<crate::ids::ServerId>,

    /// Lower/upper bound on the state-transfer flow-control window
    /// (spec.md §4.G: starts at 1, doubles to at most 1024).
    pub transfer_window_min: u32,
    pub transfer_window_max: u32,

    /// How many inner iterations the wiper/indexer run before polling for
    /// shutdown (spec.md §5, "Cancellation and timeouts").
    pub poll_shutdown_every: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            server_id: None,
            transfer_window_min: 1,
            transfer_window_max: 1024,
            poll_shutdown_every: 1000,
        }
    }
}

/// Saved instance state (spec.md §4.C, "Initialization" step 1): persisted
/// in the durable store so a restarted process recovers its identity
/// without operator input.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceState {
    pub server_id: u64,
    pub bind_address: String,
    pub coordinator_address: String,
}
