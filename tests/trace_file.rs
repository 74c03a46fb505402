//! End-to-end tests driving the public per-process/per-thread API the way
//! compiled-in instrumentation would, then reading the resulting trace file
//! back the way `seec-trace-dump` does (spec §8 testable properties).

use std::rc::Rc;

use seec_trace::config::TraceConfig;
use seec_trace::error::RuntimeErrorKind;
use seec_trace::interval::Interval;
use seec_trace::output_block::{walk_blocks, OutputStreamAllocator, BLOCK_HEADER_SIZE};
use seec_trace::process_listener::{ProcessListener, StackAreaProvider};
use seec_trace::sync_exit::SynchronizedExit;
use seec_trace::thread_listener::ThreadListener;
use seec_trace::trace_format::{BlockType, FORMAT_VERSION, MAGIC};
use seec_trace::value_store::{BlockLayout, SlotKind};

struct NoStacks;

impl StackAreaProvider for NoStacks {
    fn stack_area_for(&self, _thread_id: u32) -> Option<Interval<u64>> {
        None
    }
}

fn entry_layout() -> Rc<BlockLayout> {
    let mut b = BlockLayout::builder();
    b.reserve(SlotKind::Int64);
    Rc::new(b.build())
}

/// Reads the trace written for one process+thread lifecycle back from disk
/// and confirms the block chain is self-describing (P8): starting at offset
/// 8 and following `next` visits every block exactly once and terminates,
/// with the final block being the `ProcessTrace` written by `finalize`.
#[test]
fn self_describing_chain_closes_with_process_trace() {
    let file = tempfile::tempfile().unwrap();
    let alloc = OutputStreamAllocator::create(file).unwrap();
    let process = ProcessListener::new(TraceConfig::default(), alloc);

    process.notify_global_variable(0, 0x4000, 4, &[1, 2, 3, 4]).unwrap();
    process.register_function_address(0, 0x1000);

    let sync = SynchronizedExit::new();
    {
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        t.notify_alloca(0, 0x7000, 8).unwrap();
        t.notify_function_end(None).unwrap();
    }

    process.finalize("test_module").unwrap();

    let blocks = walk_blocks(&process.allocator).unwrap();
    assert!(!blocks.is_empty());

    let mut offsets: Vec<u64> = blocks.iter().map(|(off, _, _)| *off).collect();
    offsets.sort_unstable();
    let before_dedup = offsets.len();
    offsets.dedup();
    assert_eq!(offsets.len(), before_dedup, "every block must be visited exactly once");

    let (_, _, last_next) = *blocks.last().unwrap();
    assert_eq!(last_next, 0, "the chain must terminate");

    let (_, last_ty, _) = *blocks.last().unwrap();
    assert_eq!(last_ty, BlockType::ProcessTrace, "finalize's block is the last one reserved");
}

/// Decodes the `ProcessTrace` payload the way the dump tool does, confirming
/// the fields `finalize` wrote line up (spec §6).
#[test]
fn process_trace_payload_round_trips() {
    let file = tempfile::tempfile().unwrap();
    let alloc = OutputStreamAllocator::create(file).unwrap();
    let process = ProcessListener::new(TraceConfig::default(), alloc);

    process.notify_global_variable(0, 0x4000, 4, &[9, 9, 9, 9]).unwrap();
    process.register_function_address(0, 0x1000);

    let sync = SynchronizedExit::new();
    let thread_id = {
        let t = ThreadListener::new(&process, &sync, 7).unwrap();
        t.thread_id()
    };
    assert_eq!(thread_id, 7);

    let block_start = process.finalize("my_module").unwrap();

    let mut cursor = block_start + BLOCK_HEADER_SIZE;
    let read_u64 = |alloc: &OutputStreamAllocator, off: u64| -> u64 {
        let mut buf = [0u8; 8];
        alloc.read_at(off, &mut buf).unwrap();
        u64::from_le_bytes(buf)
    };

    let format_version = read_u64(&process.allocator, cursor);
    assert_eq!(format_version, FORMAT_VERSION);
    cursor += 8;

    let name_len = read_u64(&process.allocator, cursor);
    cursor += 8;
    let mut name = vec![0u8; name_len as usize];
    process.allocator.read_at(cursor, &mut name).unwrap();
    assert_eq!(name, b"my_module");
    cursor += name_len;

    let global_count = read_u64(&process.allocator, cursor);
    assert_eq!(global_count, 1);
    cursor += 8 + global_count * 8;

    let global_data_count = read_u64(&process.allocator, cursor);
    assert_eq!(global_data_count, 1);
    cursor += 8 + global_data_count * 8;

    let function_count = read_u64(&process.allocator, cursor);
    assert_eq!(function_count, 1);
    cursor += 8 + function_count * 8;

    let thread_stream_count = read_u64(&process.allocator, cursor);
    assert_eq!(thread_stream_count, 1);
}

/// The file always starts with the fixed magic (spec §6), regardless of
/// what gets traced afterwards.
#[test]
fn file_starts_with_magic() {
    let file = tempfile::tempfile().unwrap();
    let alloc = OutputStreamAllocator::create(file).unwrap();
    let mut magic = [0u8; 8];
    alloc.read_at(0, &mut magic).unwrap();
    assert_eq!(&magic, MAGIC);
}

/// A load from memory that was allocated but never stored to is rejected as
/// uninitialized (spec P2), exercised through the real checker plus the
/// process's shared memory/area-lookup path rather than a hand-built
/// `ContainingArea`.
#[test]
fn uninitialized_read_is_rejected_end_to_end() {
    let mut backing = vec![0u8; 16];
    let addr = backing.as_mut_ptr() as u64;

    let file = tempfile::tempfile().unwrap();
    let alloc = OutputStreamAllocator::create(file).unwrap();
    let process = ProcessListener::new(TraceConfig::default(), alloc);
    process.record_malloc(addr, 16);

    let sync = SynchronizedExit::new();
    let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
    t.notify_function_begin(0, entry_layout(), &[]).unwrap();

    let tag = process.temporal_ids().mint(addr);
    let area_owned = process.get_containing_memory_area(addr, &NoStacks, 1, &[]);
    let err = process.with_memory(|m| {
        let area = area_owned.as_checker_area(m);
        t.notify_pre_load(addr, 4, tag, &area)
    });
    let err = err.unwrap().expect("uninitialized read must be flagged");
    assert_eq!(err.kind(), RuntimeErrorKind::MemoryUninitialized);

    // Once the bytes are marked initialized (as a real store would do), the
    // same read succeeds.
    process.with_memory(|m| {
        let _ = m.add(addr, 4);
    });
    let area_owned = process.get_containing_memory_area(addr, &NoStacks, 1, &[]);
    let ok = process.with_memory(|m| {
        let area = area_owned.as_checker_area(m);
        t.notify_pre_load(addr, 4, tag, &area)
    });
    assert!(ok.unwrap().is_none());
}

/// Once freed, an address is no longer found by `getContainingMemoryArea`
/// (spec §4.10), which is how a later use-after-free load is rejected as
/// unowned memory rather than misreported as uninitialized.
#[test]
fn freed_allocation_is_no_longer_a_containing_area() {
    let mut backing = vec![0u8; 8];
    let addr = backing.as_mut_ptr() as u64;

    let file = tempfile::tempfile().unwrap();
    let alloc = OutputStreamAllocator::create(file).unwrap();
    let process = ProcessListener::new(TraceConfig::default(), alloc);

    process.record_malloc(addr, 8);
    assert!(process.is_dynamic_allocation(addr));

    process.record_free(addr);
    assert!(!process.is_dynamic_allocation(addr));

    let area = process.get_containing_memory_area(addr, &NoStacks, 1, &[]);
    assert!(matches!(area, seec_trace::process_listener::ContainingAreaOwned::None));
}
