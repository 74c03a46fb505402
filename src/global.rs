//! Process-wide lazy initialization (spec §9 "Global-state lifecycle"): the
//! process listener is constructed by the first thread's first notification
//! under a one-shot guard; each thread lazily constructs its own
//! `ThreadListener` on first use and it is torn down when the OS thread
//! exits (`ThreadListener`'s `Drop`).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::config::TraceConfig;
use crate::output_block::OutputStreamAllocator;
use crate::process_listener::ProcessListener;
use crate::sync_exit::SynchronizedExit;
use crate::thread_listener::ThreadListener;

struct ProcessState {
    listener: ProcessListener,
    sync_exit: SynchronizedExit,
}

static PROCESS: OnceLock<ProcessState> = OnceLock::new();
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

fn process() -> &'static ProcessState {
    PROCESS.get_or_init(|| {
        let config = TraceConfig::from_env();
        let file = std::fs::File::create(config.path()).expect("failed to create trace file");
        let allocator =
            OutputStreamAllocator::create(file).expect("failed to initialize trace output");
        let listener = ProcessListener::new(config, allocator);
        let state = ProcessState { listener, sync_exit: SynchronizedExit::new() };
        #[cfg(unix)]
        if let Err(e) = crate::signal::install(&state.listener.allocator) {
            log::warn!("failed to install signal handler: {e}");
        }
        state
    })
}

thread_local! {
    static THIS_THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
    static THREAD: RefCell<Option<ThreadListener<'static>>> = const { RefCell::new(None) };
}

/// Runs `f` against the calling thread's `ThreadListener`, constructing it
/// on first use.
pub fn with_thread_listener<R>(f: impl FnOnce(&mut ThreadListener<'static>) -> R) -> R {
    THREAD.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let thread_id = THIS_THREAD_ID.with(|id| *id);
            let state = process();
            let listener = ThreadListener::new(&state.listener, &state.sync_exit, thread_id)
                .expect("failed to initialize per-thread trace stream");
            *slot = Some(listener);
        }
        f(slot.as_mut().expect("just initialized above"))
    })
}

pub fn process_listener() -> &'static ProcessListener {
    &process().listener
}

/// Normal-path teardown (spec §9): writes the `ProcessTrace` block and
/// syncs the file. Called once by the traced program's instrumented exit
/// path; a process that never exits cleanly (killed, `_exit`d without
/// running atexit handlers) simply never gets a `ProcessTrace` block, which
/// a viewer detects by reaching EOF before closing the chain.
pub fn shutdown(module_identifier: &str) -> std::io::Result<()> {
    process().listener.finalize(module_identifier)?;
    Ok(())
}
