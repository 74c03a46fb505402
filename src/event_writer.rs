//! Per-thread trace-event writer (spec §4.6).
//!
//! Wraps an `OutputBlockThreadEventStream`: writes events by stamping in the
//! previous event's size, then remembers the new event's size for next time.
//! Supports in-place rewriting of a previously-written event via its
//! `WriteRecord`, used at function entry to back-patch `FunctionStart` once
//! the function's exit details are known.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::output_block::{OutputBlockThreadEventStream, OutputStreamAllocator, WriteRecord};
use crate::trace_format::TraceEvent;

pub struct EventWriter<'a> {
    stream: OutputBlockThreadEventStream<'a>,
    alloc: &'a OutputStreamAllocator,
    last_size: AtomicU8,
    // Serializes "stamp previous size, write" as one logical step; the
    // underlying stream is itself safe for concurrent writers, but a
    // thread's own event stream must never be written by two callers at
    // once (thread listeners are exclusively owned per spec §5).
    write_lock: Mutex<()>,
}

impl<'a> EventWriter<'a> {
    pub fn new(alloc: &'a OutputStreamAllocator, thread_id: u32) -> std::io::Result<Self> {
        Ok(EventWriter {
            stream: OutputBlockThreadEventStream::new(alloc, thread_id)?,
            alloc,
            last_size: AtomicU8::new(0),
            write_lock: Mutex::new(()),
        })
    }

    pub fn thread_id(&self) -> u32 {
        self.stream.thread_id()
    }

    /// Offset of this thread's event stream's first block (spec §6
    /// "initial-stream address table").
    pub fn head_offset(&self) -> u64 {
        self.stream.head_offset()
    }

    /// Writes one event, filling in `previous_event_size` from the last
    /// write on this thread, and returns the offset it landed at along with
    /// the event as actually stamped and written (spec R1) — callers that
    /// need to back-patch the record later (e.g. `FunctionStart`) keep the
    /// stamped copy so a later `rewrite` doesn't clobber its
    /// `previous_event_size`.
    pub fn write<E: TraceEvent>(&self, mut event: E) -> std::io::Result<(u64, E)> {
        let _guard = self.write_lock.lock().unwrap();
        let prev = self.last_size.load(Ordering::Relaxed);
        event.set_previous_event_size(prev);
        let offset = self.stream.write(event.as_bytes())?;
        self.last_size.store(event.size(), Ordering::Relaxed);
        Ok((offset, event))
    }

    /// Rewrites the event previously written at `record`'s offset. Touches
    /// only that span of the file (spec R2); does not affect `last_size`.
    pub fn rewrite<E: TraceEvent>(&self, record: WriteRecord, event: E) -> std::io::Result<()> {
        debug_assert_eq!(record.size(), event.size() as u64);
        self.alloc.write_at(record.offset(), event.as_bytes())
    }

    /// Writes the final `TraceEnd` event closing this thread's stream.
    pub fn write_trace_end(&self) -> std::io::Result<u64> {
        self.write(crate::trace_format::TraceEnd::new(0)).map(|(offset, _)| offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_format::{Free, Malloc};
    use tempfile::tempfile;

    #[test]
    fn previous_event_size_chains_correctly() {
        let alloc = OutputStreamAllocator::create(tempfile().unwrap()).unwrap();
        let writer = EventWriter::new(&alloc, 1).unwrap();
        let first = Malloc::new(0, 1, 0x1000, 16);
        writer.write(first).unwrap();
        let second = Free::new(first.size(), 2, 0x1000);
        writer.write(second).unwrap();
        assert_eq!(second.size(), std::mem::size_of::<Free>() as u8);
    }

    #[test]
    fn rewrite_replaces_only_that_event() {
        let alloc = OutputStreamAllocator::create(tempfile().unwrap()).unwrap();
        let writer = EventWriter::new(&alloc, 1).unwrap();
        let ev = Malloc::new(0, 1, 0x1000, 16);
        let (record_offset, _) = writer.write(ev).unwrap();
        let record = crate::output_block::WriteRecord::new(record_offset, ev.size() as u64);
        let replaced = Malloc::new(0, 1, 0x1000, 32);
        writer.rewrite(record, replaced).unwrap();
    }
}
