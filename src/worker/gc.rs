//! Quiescence-based collector registry (spec.md §9, "Cyclic ownership...";
//! background workers "register with GC", "declare quiescent", "declare
//! offline/online").
//!
//! Key-state and transfer-state entries in this engine are reclaimed
//! through ordinary `Arc` reference counting, not a custom tracing
//! collector — Rust's ownership model already gives us the safety property
//! the original's garbage collector existed to provide by hand. What the
//! background-worker framework still needs from "the GC" is the
//! *coordination* surface: a place for every worker thread to publish
//! "I am at a safe point" so a pauser waiting for every worker to reach its
//! wait point can make progress even while one worker is blocked in a long
//! external call (`offline`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static REGISTRY: Lazy<DashMap<u64, Arc<ThreadState>>> = Lazy::new(DashMap::new);
static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

struct ThreadState {
    quiescent: AtomicBool,
    offline: AtomicBool,
}

/// A handle a background worker holds for its own lifetime, used to
/// publish quiescent/offline state and to deregister on exit.
pub struct GcToken {
    id: u64,
    state: Arc<ThreadState>,
}

impl GcToken {
    pub fn register() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ThreadState {
            quiescent: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        });
        REGISTRY.insert(id, state.clone());
        GcToken { id, state }
    }

    pub fn mark_quiescent(&self) {
        self.state.quiescent.store(true, Ordering::Release);
    }

    pub fn mark_active(&self) {
        self.state.quiescent.store(false, Ordering::Release);
    }

    pub fn declare_offline(&self) {
        self.state.offline.store(true, Ordering::Release);
    }

    pub fn declare_online(&self) {
        self.state.offline.store(false, Ordering::Release);
    }
}

impl Drop for GcToken {
    fn drop(&mut self) {
        REGISTRY.remove(&self.id);
    }
}

/// Number of registered worker threads that are neither quiescent nor
/// offline — used only by tests to assert pause brackets actually drain
/// activity.
pub fn active_thread_count() -> usize {
    REGISTRY
        .iter()
        .filter(|e| {
            !e.value().quiescent.load(Ordering::Acquire) && !e.value().offline.load(Ordering::Acquire)
        })
        .count()
}
