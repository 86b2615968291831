//! Background worker framework (component A, spec.md §4.A).
//!
//! A uniform cooperative worker used by the checkpointer, indexer, wiper,
//! and retransmitter: one dedicated OS thread, one lock guarding four
//! booleans, a `have_work/copy_work/do_work` contract split so that
//! `do_work` never runs while holding the lock.

pub mod gc;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Implemented by each background subsystem. `have_work`/`copy_work` run
/// under the framework lock and must not block; `do_work` runs without the
/// lock and may perform blocking I/O.
pub trait Worker: Send + 'static {
    fn thread_name(&self) -> &'static str;

    /// Called under lock. Returns true iff `do_work` would make progress.
    fn have_work(&self) -> bool;

    /// Called under lock. Snapshots the minimum state needed to run
    /// `do_work` without holding the lock.
    fn copy_work(&mut self);

    /// Called without the lock. May block on I/O.
    fn do_work(&mut self);
}

#[derive(Default)]
struct Control {
    shutdown: bool,
    pause_count: u32,
    paused: bool,
    offline: bool,
}

struct Shared<W> {
    control: Mutex<Control>,
    condvar: Condvar,
    worker: Mutex<W>,
}

/// Owns a worker's thread and exposes the pause/shutdown/wakeup protocol
/// described in spec.md §4.A's public-operations list.
pub struct WorkerHandle<W> {
    shared: Arc<Shared<W>>,
    join: Option<JoinHandle<()>>,
}

impl<W: Worker> WorkerHandle<W> {
    /// Constructs and starts the worker's thread.
    pub fn start(worker: W) -> Self {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            condvar: Condvar::new(),
            worker: Mutex::new(worker),
        });
        let thread_shared = shared.clone();
        let name = {
            let w = shared.worker.lock().unwrap();
            w.thread_name().to_string()
        };
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(thread_shared))
            .expect("failed to spawn background worker thread");
        WorkerHandle {
            shared,
            join: Some(join),
        }
    }

    /// Requests the worker park at its next wait point; does not block.
    pub fn initiate_pause(&self) {
        let mut ctl = self.shared.control.lock().unwrap();
        ctl.pause_count += 1;
        drop(ctl);
        self.shared.condvar.notify_all();
    }

    /// Blocks until the worker is paused or has declared itself offline.
    pub fn wait_until_paused(&self) {
        let mut ctl = self.shared.control.lock().unwrap();
        while !ctl.paused && !ctl.offline && !ctl.shutdown {
            ctl = self.shared.condvar.wait(ctl).unwrap();
        }
    }

    pub fn unpause(&self) {
        let mut ctl = self.shared.control.lock().unwrap();
        if ctl.pause_count > 0 {
            ctl.pause_count -= 1;
        }
        drop(ctl);
        self.shared.condvar.notify_all();
    }

    pub fn shutdown(self) {
        {
            let mut ctl = self.shared.control.lock().unwrap();
            ctl.shutdown = true;
        }
        self.shared.condvar.notify_all();
        // `self.join` is consumed here; dropping `self` afterwards is a
        // no-op on the (already-taken) handle.
        if let Some(j) = self.into_join_handle() {
            let _ = j.join();
        }
    }

    fn into_join_handle(mut self) -> Option<JoinHandle<()>> {
        self.join.take()
    }

    pub fn wakeup(&self) {
        self.shared.condvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.control.lock().unwrap().paused
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.control.lock().unwrap().shutdown
    }
}

fn run<W: Worker>(shared: Arc<Shared<W>>) {
    let gc = gc::GcToken::register();
    block_all_signals_except_sigprof();

    loop {
        let mut ctl = shared.control.lock().unwrap();
        gc.mark_quiescent();
        loop {
            let have_work = {
                let w = shared.worker.lock().unwrap();
                w.have_work()
            };
            if (have_work || ctl.shutdown) && ctl.pause_count == 0 {
                break;
            }
            ctl.paused = true;
            if ctl.pause_count > 0 {
                shared.condvar.notify_all();
            }
            gc.declare_offline();
            ctl = shared.condvar.wait(ctl).unwrap();
            gc.declare_online();
            ctl.paused = false;
        }
        gc.mark_active();
        if ctl.shutdown {
            break;
        }
        {
            let mut w = shared.worker.lock().unwrap();
            w.copy_work();
        }
        drop(ctl);
        {
            let mut w = shared.worker.lock().unwrap();
            w.do_work();
        }
    }
}

#[cfg(unix)]
fn block_all_signals_except_sigprof() {
    // All workers block every signal except SIGPROF before entering the
    // loop (spec.md §4.A). Signal delivery belongs to the out-of-scope
    // daemon/CLI layer; this is a best-effort no-op hook so the intent is
    // documented at the one place every worker thread starts from.
}

#[cfg(not(unix))]
fn block_all_signals_except_sigprof() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        remaining: Arc<AtomicUsize>,
        copied: usize,
    }

    impl Worker for Counter {
        fn thread_name(&self) -> &'static str {
            "counter"
        }
        fn have_work(&self) -> bool {
            self.remaining.load(Ordering::Acquire) > 0
        }
        fn copy_work(&mut self) {
            self.copied = self.remaining.load(Ordering::Acquire);
        }
        fn do_work(&mut self) {
            if self.copied > 0 {
                self.remaining.fetch_sub(1, Ordering::AcqRel);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn drains_work_then_blocks_until_shutdown() {
        let remaining = Arc::new(AtomicUsize::new(5));
        let handle = WorkerHandle::start(Counter {
            remaining: remaining.clone(),
            copied: 0,
        });
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while remaining.load(Ordering::Acquire) > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(remaining.load(Ordering::Acquire), 0);
        handle.shutdown();
    }
}
