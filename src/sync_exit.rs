//! Synchronized, all-thread stop-the-world before `abort`/`_Exit`/`exit`
//! and before fatal-error termination (spec §4.12).

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct State {
    registered: HashSet<u32>,
    stopping: bool,
    /// Threads that have observed `stopping` and are parked in `check()`.
    stopped: HashSet<u32>,
}

/// Process-wide stop-the-world coordinator. Each thread registers on
/// construction (of its `ThreadListener`) and deregisters on destruction.
pub struct SynchronizedExit {
    state: Mutex<State>,
    cond: Condvar,
}

impl SynchronizedExit {
    pub fn new() -> Self {
        SynchronizedExit { state: Mutex::new(State::default()), cond: Condvar::new() }
    }

    pub fn register(&self, thread_id: u32) {
        self.state.lock().unwrap().registered.insert(thread_id);
    }

    pub fn deregister(&self, thread_id: u32) {
        let mut state = self.state.lock().unwrap();
        state.registered.remove(&thread_id);
        state.stopped.remove(&thread_id);
        self.cond.notify_all();
    }

    /// Must be called at every notification entry (spec E1): if a stop is
    /// in progress, the calling thread blocks here until released.
    pub fn check(&self, thread_id: u32) {
        let mut state = self.state.lock().unwrap();
        while state.stopping {
            state.stopped.insert(thread_id);
            self.cond.notify_all();
            state = self.cond.wait(state).unwrap();
        }
        state.stopped.remove(&thread_id);
    }

    /// Causes all other registered threads to block in `check()` until
    /// either released or the initiating thread calls `abort`/`exit`.
    /// Blocks until every other registered thread has observed the stop.
    pub fn stop_all(&self, initiating_thread: u32) {
        let mut state = self.state.lock().unwrap();
        state.stopping = true;
        self.cond.notify_all();
        loop {
            let others_stopped = state
                .registered
                .iter()
                .all(|&t| t == initiating_thread || state.stopped.contains(&t));
            if others_stopped {
                break;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Releases other threads without a terminal action following (spec
    /// E3). The caller is responsible for ensuring no further unprotected
    /// access to stopped-dependent invariants follows this call.
    pub fn cancel_stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopping = false;
        self.cond.notify_all();
    }

    /// Runs intercepted `atexit` handlers via `run_atexit`, then performs a
    /// clean shutdown: `finalize` is expected to flush every thread's event
    /// stream and close the file. Observes that every other thread is
    /// quiescent before returning (spec E2).
    pub fn exit(&self, initiating_thread: u32, run_atexit: impl FnOnce(), finalize: impl FnOnce()) -> ! {
        self.stop_all(initiating_thread);
        run_atexit();
        finalize();
        std::process::exit(1)
    }

    /// Skips `atexit` handlers (spec §4.12 `abort()`).
    pub fn abort(&self, initiating_thread: u32, finalize: impl FnOnce()) -> ! {
        self.stop_all(initiating_thread);
        finalize();
        std::process::abort()
    }
}

impl Default for SynchronizedExit {
    fn default() -> Self {
        SynchronizedExit::new()
    }
}

/// RAII guard that calls `cancel_stop` on drop, matching spec E3's
/// "StopCanceller" — a thread may release the others if no terminal action
/// follows.
pub struct StopCanceller<'a> {
    exit: &'a SynchronizedExit,
}

impl<'a> StopCanceller<'a> {
    pub fn new(exit: &'a SynchronizedExit) -> Self {
        StopCanceller { exit }
    }
}

impl Drop for StopCanceller<'_> {
    fn drop(&mut self) {
        self.exit.cancel_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn check_blocks_only_while_stopping() {
        let exit = Arc::new(SynchronizedExit::new());
        exit.register(1);
        exit.check(1); // no-op, nothing stopping
    }

    #[test]
    fn stop_all_waits_for_other_threads_to_observe() {
        let exit = Arc::new(SynchronizedExit::new());
        exit.register(1);
        exit.register(2);

        let worker_exit = Arc::clone(&exit);
        let worker = thread::spawn(move || loop {
            worker_exit.check(2);
            if !worker_exit.state.lock().unwrap().registered.contains(&2) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        });

        exit.stop_all(1);
        assert!(exit.state.lock().unwrap().stopped.contains(&2));
        exit.cancel_stop();
        exit.deregister(2);
        worker.join().unwrap();
    }

    #[test]
    fn stop_canceller_releases_on_drop() {
        let exit = SynchronizedExit::new();
        exit.register(1);
        {
            let _guard = StopCanceller::new(&exit);
            exit.stop_all(1);
        }
        assert!(!exit.state.lock().unwrap().stopping);
    }
}
