//! Terminating-signal capture (spec §5 "Signal handling").
//!
//! A process-wide handler is installed once, before any worker thread is
//! spawned: on catching a terminating signal it records a `SignalInfo` block
//! naming the signal, the current thread's ID and thread time, then restores
//! the signal's default disposition and re-raises it so the traced program's
//! own crash behaviour (core dump, exit status) is unchanged. Other
//! terminating signals are additionally blocked on every worker thread, so
//! only the thread that installed the handler ever observes them.

use std::cell::Cell;
use std::io;
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::output_block::{OutputBlockBuilder, OutputStreamAllocator};
use crate::trace_format::BlockType;

thread_local! {
    /// Updated on every notification entry; read by the signal handler to
    /// attribute a caught signal to the thread and thread-time it
    /// interrupted. Not async-signal-safe in the strict POSIX sense (a
    /// `Cell` read is not on the reentrant-safe function list), best-effort
    /// only.
    static CURRENT: Cell<(u32, u64)> = const { Cell::new((0, 0)) };
}

/// Records this thread's current identity and thread-time, called once per
/// notification (see `ThreadListener::enter_notification`).
pub fn record_current_thread(thread_id: u32, thread_time: u64) {
    CURRENT.with(|c| c.set((thread_id, thread_time)));
}

/// Signals that indicate the traced program invoked genuine undefined
/// behaviour: delivered immediately to the faulting thread, never blocked.
const UB_SIGNALS: &[Signal] =
    &[Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGILL, Signal::SIGFPE, Signal::SIGABRT];

/// Other terminating signals: blocked on every worker thread so only the
/// thread that called `install` (the main thread, before workers exist)
/// observes them (spec §5).
const BLOCKABLE_TERMINATING_SIGNALS: &[Signal] =
    &[Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT];

static ALLOCATOR: OnceLock<&'static OutputStreamAllocator> = OnceLock::new();

fn description(sig: Signal) -> &'static str {
    match sig {
        Signal::SIGSEGV => "invalid memory reference",
        Signal::SIGBUS => "bus error (bad memory access alignment)",
        Signal::SIGILL => "illegal instruction",
        Signal::SIGFPE => "erroneous arithmetic operation",
        Signal::SIGABRT => "abort signal",
        Signal::SIGTERM => "termination request",
        Signal::SIGINT => "interrupt from keyboard",
        Signal::SIGHUP => "hangup detected on controlling terminal",
        Signal::SIGQUIT => "quit from keyboard",
        _ => "unrecognized signal",
    }
}

/// Installs the handler for every terminating signal and records the
/// allocator the handler writes `SignalInfo` blocks to. Must run before any
/// worker thread is spawned (spec §5); the calling thread keeps the
/// blockable signals unblocked, every later worker thread blocks them via
/// `block_on_worker_thread`.
pub fn install(allocator: &'static OutputStreamAllocator) -> nix::Result<()> {
    let _ = ALLOCATOR.set(allocator);
    let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::empty(), SigSet::empty());
    for &sig in UB_SIGNALS.iter().chain(BLOCKABLE_TERMINATING_SIGNALS) {
        unsafe { signal::sigaction(sig, &action)? };
    }
    Ok(())
}

/// Blocks the non-undefined-behaviour terminating signals on the calling
/// thread. Called once per worker thread at `ThreadListener` construction
/// (spec §5 "blocking signals is done on every worker thread for all
/// non-undefined-behavior signals").
pub fn block_on_worker_thread() -> nix::Result<()> {
    let mut set = SigSet::empty();
    for &sig in BLOCKABLE_TERMINATING_SIGNALS {
        set.add(sig);
    }
    signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), None)
}

extern "C" fn handle_signal(raw: libc::c_int) {
    let signal = Signal::try_from(raw).ok();
    let (thread_id, thread_time) = CURRENT.with(Cell::get);
    if let Some(allocator) = ALLOCATOR.get() {
        let _ = write_signal_info(allocator, thread_id, thread_time, raw, signal);
    }
    // Restore the default disposition and re-raise so the traced program's
    // own crash behaviour (core dump, exit status) is observed.
    if let Some(sig) = signal {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = signal::sigaction(sig, &default);
        }
        let _ = signal::raise(sig);
    }
}

fn write_signal_info(
    allocator: &OutputStreamAllocator,
    thread_id: u32,
    thread_time: u64,
    raw_signal: libc::c_int,
    signal: Option<Signal>,
) -> io::Result<u64> {
    let name = signal.map(|s| s.as_str()).unwrap_or("UNKNOWN");
    let desc = signal.map(description).unwrap_or("unrecognized signal");

    let mut builder = OutputBlockBuilder::new();
    builder.write(&thread_id.to_le_bytes());
    builder.write_u64(thread_time);
    builder.write(&raw_signal.to_le_bytes());
    builder.write_u64(name.len() as u64);
    builder.write(name.as_bytes());
    builder.write_u64(desc.len() as u64);
    builder.write(desc.as_bytes());
    builder.flush(allocator, BlockType::SignalInfo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn current_thread_round_trips_through_thread_local() {
        record_current_thread(7, 42);
        assert_eq!(CURRENT.with(Cell::get), (7, 42));
    }

    #[test]
    fn write_signal_info_produces_a_signal_info_block() {
        let alloc = OutputStreamAllocator::create(tempfile().unwrap()).unwrap();
        let offset = write_signal_info(&alloc, 3, 99, Signal::SIGSEGV as libc::c_int, Some(Signal::SIGSEGV))
            .unwrap();
        assert!(offset > 0);
    }

    #[test]
    fn every_ub_signal_has_a_description() {
        for &sig in UB_SIGNALS {
            assert_ne!(description(sig), "unrecognized signal");
        }
    }
}
