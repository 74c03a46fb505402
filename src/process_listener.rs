//! Global, process-wide tracer state (spec §3 "Process state", §4.10).
//!
//! A single instance is shared (behind `Arc`) by every `ThreadListener`.
//! Its construction is triggered lazily by the first thread's first
//! notification under a one-shot initialization guard (spec §9
//! "Global-state lifecycle"); its teardown writes the process trace block
//! and closes all streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::checker::ContainingArea;
use crate::config::TraceConfig;
use crate::detect_calls::DetectCallsLookup;
use crate::interval::{Interval, MemoryArea, Permission};
use crate::interval_map::IntervalMapVector;
use crate::output_block::{
    OutputBlockBuilder, OutputBlockProcessDataStream, OutputStreamAllocator, BLOCK_HEADER_SIZE,
};
use crate::pointer_object::{InMemoryPointerObjectMap, PointerTarget, TemporalIdTable};
use crate::shadow_memory::TraceMemoryState;
use crate::trace_format::BlockType;

/// A dynamically allocated region (`malloc`/`realloc`), keyed by the
/// user-visible address `malloc` returned (spec §3 "dynamic-allocation
/// map").
#[derive(Clone, Copy, Debug)]
pub struct DynamicAllocation {
    pub size: u64,
}

/// An open `FILE*`/`DIR*` handle tracked so shims can validate arguments
/// against it (spec §4.8 CIOChecker/DIRChecker, §4.10 "stream and DIR
/// tables").
#[derive(Default)]
pub struct HandleTable {
    handles: Mutex<Vec<u64>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable::default()
    }

    pub fn register(&self, handle: u64) {
        self.handles.lock().unwrap().push(handle);
    }

    pub fn deregister(&self, handle: u64) {
        self.handles.lock().unwrap().retain(|&h| h != handle);
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.handles.lock().unwrap().clone()
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.handles.lock().unwrap().contains(&handle)
    }
}

/// Where in a thread's own stack area an address falls, used by
/// `get_containing_memory_area`'s "other threads' stacks" search step.
pub trait StackAreaProvider: Send + Sync {
    fn stack_area_for(&self, thread_id: u32) -> Option<Interval<u64>>;
}

/// Per-process registries: global/function address tables, the shadow
/// memory map, the known-memory map, the dynamic-allocation map, the
/// in-memory pointer-object map, stream/DIR tables, and the thread registry
/// (spec §3 "Process state", §4.10).
pub struct ProcessListener {
    pub config: TraceConfig,
    pub allocator: OutputStreamAllocator,

    process_time: AtomicU64,

    memory: Mutex<TraceMemoryState>,
    known_memory: Mutex<IntervalMapVector<Permission>>,
    global_variables: Mutex<IntervalMapVector<u32>>,
    global_variable_addresses: Mutex<Vec<u64>>,
    global_variable_data_offsets: Mutex<Vec<u64>>,
    function_addresses: Mutex<Vec<u64>>,
    dynamic_allocations: Mutex<HashMap<u64, DynamicAllocation>>,
    in_memory_pointers: Mutex<InMemoryPointerObjectMap>,
    temporal_ids: TemporalIdTable,

    pub streams: HandleTable,
    pub dirs: HandleTable,

    pub call_sites: RwLock<DetectCallsLookup>,

    registered_threads: Mutex<Vec<u32>>,
    thread_stream_heads: Mutex<Vec<(u32, u64)>>,
}

impl ProcessListener {
    pub fn new(config: TraceConfig, allocator: OutputStreamAllocator) -> Self {
        ProcessListener {
            config,
            allocator,
            process_time: AtomicU64::new(0),
            memory: Mutex::new(TraceMemoryState::new()),
            known_memory: Mutex::new(IntervalMapVector::new()),
            global_variables: Mutex::new(IntervalMapVector::new()),
            global_variable_addresses: Mutex::new(Vec::new()),
            global_variable_data_offsets: Mutex::new(Vec::new()),
            function_addresses: Mutex::new(Vec::new()),
            dynamic_allocations: Mutex::new(HashMap::new()),
            in_memory_pointers: Mutex::new(InMemoryPointerObjectMap::new()),
            temporal_ids: TemporalIdTable::new(),
            streams: HandleTable::new(),
            dirs: HandleTable::new(),
            call_sites: RwLock::new(DetectCallsLookup::new()),
            registered_threads: Mutex::new(Vec::new()),
            thread_stream_heads: Mutex::new(Vec::new()),
        }
    }

    /// Current process time (spec §3 "a single monotonic process time").
    pub fn process_time(&self) -> u64 {
        self.process_time.load(Ordering::SeqCst)
    }

    /// Increments process time, returning the new value. Called by every
    /// shared-state-modifying event (spec §3).
    pub fn bump_process_time(&self) -> u64 {
        self.process_time.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn temporal_ids(&self) -> &TemporalIdTable {
        &self.temporal_ids
    }

    pub fn register_thread(&self, thread_id: u32) {
        self.registered_threads.lock().unwrap().push(thread_id);
    }

    pub fn deregister_thread(&self, thread_id: u32) {
        self.registered_threads.lock().unwrap().retain(|&t| t != thread_id);
    }

    /// Records a thread event stream's first block offset, for the
    /// `ProcessTrace` block's initial-stream address table (spec §6).
    pub fn register_thread_stream_head(&self, thread_id: u32, head_offset: u64) {
        self.thread_stream_heads.lock().unwrap().push((thread_id, head_offset));
    }

    // ---- global variables (spec §4.10 notifyGlobalVariable) ----

    /// Pushes a global's address and writes its initial byte contents to the
    /// process-data stream, recording the resulting offset for the
    /// `ProcessTrace` block's global-variable initial-data table (spec §6).
    /// Called once per global at startup.
    pub fn notify_global_variable(
        &self,
        index: u32,
        address: u64,
        size: u64,
        initial_data: &[u8],
    ) -> std::io::Result<()> {
        self.global_variables.lock().unwrap().insert(address, address + size, index);
        self.global_variable_addresses.lock().unwrap().push(address);
        // A global has lifetime-forever: temporal id 0 (spec §4.4).
        let mut builder = OutputBlockBuilder::new();
        builder.write(initial_data);
        let block_start = builder.flush(&self.allocator, BlockType::ProcessData)?;
        self.global_variable_data_offsets.lock().unwrap().push(block_start + BLOCK_HEADER_SIZE);
        Ok(())
    }

    /// Walks every global's pointer-typed fields (recursively through
    /// structs/arrays/vectors) to seed the in-memory pointer-object map, once
    /// all globals have been registered (spec §4.10
    /// `notifyGlobalVariablesComplete`). `pointer_fields` yields, for a
    /// global's address and size, every `(field_address, target_tag)` pair
    /// the loader found by walking its type.
    pub fn notify_global_variables_complete(
        &self,
        pointer_fields: impl IntoIterator<Item = (u64, PointerTarget)>,
    ) {
        let mut pointers = self.in_memory_pointers.lock().unwrap();
        for (addr, tag) in pointer_fields {
            pointers.set(addr, 8, tag);
        }
    }

    pub fn register_function_address(&self, index: u32, address: u64) {
        let mut addrs = self.function_addresses.lock().unwrap();
        if addrs.len() <= index as usize {
            addrs.resize(index as usize + 1, 0);
        }
        addrs[index as usize] = address;
    }

    // ---- shadow memory ----

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut TraceMemoryState) -> R) -> R {
        let mut mem = self.memory.lock().unwrap();
        f(&mut mem)
    }

    pub fn add_known_region(&self, start: u64, end: u64, permission: Permission) -> bool {
        self.known_memory.lock().unwrap().insert(start, end, permission)
    }

    pub fn remove_known_region(&self, start: u64) {
        self.known_memory.lock().unwrap().remove(start);
    }

    // ---- dynamic allocation map ----

    pub fn record_malloc(&self, address: u64, size: u64) {
        self.dynamic_allocations.lock().unwrap().insert(address, DynamicAllocation { size });
        self.with_memory(|m| {
            let _ = m.add_allocation(address, size);
        });
    }

    pub fn record_free(&self, address: u64) {
        self.dynamic_allocations.lock().unwrap().remove(&address);
        self.with_memory(|m| {
            m.remove_allocation(address);
        });
    }

    pub fn is_dynamic_allocation(&self, address: u64) -> bool {
        self.dynamic_allocations.lock().unwrap().contains_key(&address)
    }

    // ---- in-memory pointer-object map ----

    pub fn with_pointers<R>(&self, f: impl FnOnce(&mut InMemoryPointerObjectMap) -> R) -> R {
        let mut p = self.in_memory_pointers.lock().unwrap();
        f(&mut p)
    }

    /// For any address, searches global variables, then dynamic
    /// allocations, then known regions, then (if given) other threads'
    /// stacks (spec §4.10 `getContainingMemoryArea`). This is the authority
    /// for temporal IDs: the allocation's base address is what
    /// `TemporalIdTable` keys on.
    pub fn get_containing_memory_area(
        &self,
        addr: u64,
        stacks: &dyn StackAreaProvider,
        requesting_thread_id: u32,
        other_thread_ids: &[u32],
    ) -> ContainingAreaOwned {
        // Global variables and dynamic allocations are both registered into
        // the shadow-memory map (spec §3), so one lookup covers both.
        {
            let mem = self.memory.lock().unwrap();
            if let Some(alloc) = mem.find_allocation_containing(addr) {
                return ContainingAreaOwned::Allocation(alloc.range());
            }
        }
        {
            let known = self.known_memory.lock().unwrap();
            if let Some(&permission) = known.find(addr) {
                // `find` only hands back the value; recover the matching
                // range with a second bounded scan (known regions are few
                // compared to user allocations).
                if let Some((range, _)) = known.iter().find(|(r, _)| r.contains_value(addr)) {
                    return ContainingAreaOwned::Known(MemoryArea::new(
                        range.start(),
                        range.end(),
                        permission,
                    ));
                }
            }
        }
        for &tid in other_thread_ids {
            if tid == requesting_thread_id {
                continue;
            }
            if let Some(range) = stacks.stack_area_for(tid) {
                if range.contains_value(addr) {
                    return ContainingAreaOwned::Allocation(range);
                }
            }
        }
        ContainingAreaOwned::None
    }

    /// Opaque bytes written to the process-data stream, returned as a file
    /// offset (spec §4.10 `recordData`).
    pub fn record_data(&self, stream: &OutputBlockProcessDataStream<'_>, bytes: &[u8]) -> std::io::Result<u64> {
        stream.record(bytes)
    }

    /// Writes the `ProcessTrace` block closing out the trace (spec §9
    /// "Global-state lifecycle": "its teardown writes the process trace
    /// block and closes all streams"). Returns the block's start offset.
    /// `module_identifier` names the traced module (spec §6).
    pub fn finalize(&self, module_identifier: &str) -> std::io::Result<u64> {
        let mut builder = OutputBlockBuilder::new();
        builder.write_u64(crate::trace_format::FORMAT_VERSION);
        let name = module_identifier.as_bytes();
        builder.write_u64(name.len() as u64);
        builder.write(name);
        let globals = self.global_variable_addresses.lock().unwrap();
        builder.write_u64(globals.len() as u64);
        for &addr in globals.iter() {
            builder.write_u64(addr);
        }
        let global_data = self.global_variable_data_offsets.lock().unwrap();
        builder.write_u64(global_data.len() as u64);
        for &off in global_data.iter() {
            builder.write_u64(off);
        }
        let functions = self.function_addresses.lock().unwrap();
        builder.write_u64(functions.len() as u64);
        for &addr in functions.iter() {
            builder.write_u64(addr);
        }
        let heads = self.thread_stream_heads.lock().unwrap();
        builder.write_u64(heads.len() as u64);
        for &(thread_id, offset) in heads.iter() {
            builder.write_u64(u64::from(thread_id));
            builder.write_u64(offset);
        }
        let block_start = builder.flush(&self.allocator, BlockType::ProcessTrace)?;
        self.allocator.sync()?;
        Ok(block_start)
    }
}

/// An owned variant of `ContainingArea` (which borrows a shadow-memory
/// reference) suitable for returning from a function that only holds its
/// lock transiently. Checkers that need shadow-initialization state
/// re-acquire the lock themselves via `ProcessListener::with_memory`.
pub enum ContainingAreaOwned {
    Allocation(Interval<u64>),
    Known(MemoryArea),
    None,
}

impl ContainingAreaOwned {
    pub fn as_checker_area<'a>(&self, memory: &'a TraceMemoryState) -> ContainingArea<'a> {
        match self {
            ContainingAreaOwned::Allocation(range) => ContainingArea::Allocation(*range, memory),
            ContainingAreaOwned::Known(area) => ContainingArea::Known(*area),
            ContainingAreaOwned::None => ContainingArea::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    struct NoStacks;
    impl StackAreaProvider for NoStacks {
        fn stack_area_for(&self, _thread_id: u32) -> Option<Interval<u64>> {
            None
        }
    }

    fn listener() -> ProcessListener {
        let alloc = OutputStreamAllocator::create(tempfile().unwrap()).unwrap();
        ProcessListener::new(TraceConfig::default(), alloc)
    }

    #[test]
    fn process_time_is_monotonic() {
        let p = listener();
        assert_eq!(p.process_time(), 0);
        assert_eq!(p.bump_process_time(), 1);
        assert_eq!(p.bump_process_time(), 2);
    }

    #[test]
    fn malloc_then_free_updates_dynamic_map_and_shadow() {
        let p = listener();
        p.record_malloc(0x3000, 16);
        assert!(p.is_dynamic_allocation(0x3000));
        assert!(p.with_memory(|m| m.find_allocation_containing(0x3000).is_some()));
        p.record_free(0x3000);
        assert!(!p.is_dynamic_allocation(0x3000));
        assert!(p.with_memory(|m| m.find_allocation_containing(0x3000).is_none()));
    }

    #[test]
    fn containing_area_finds_known_region() {
        let p = listener();
        p.add_known_region(0x4000, 0x4010, Permission::ReadOnly);
        let area = p.get_containing_memory_area(0x4004, &NoStacks, 1, &[]);
        matches!(area, ContainingAreaOwned::Known(_));
    }

    #[test]
    fn containing_area_is_none_for_unmapped_address() {
        let p = listener();
        let area = p.get_containing_memory_area(0xdead_beef, &NoStacks, 1, &[]);
        assert!(matches!(area, ContainingAreaOwned::None));
    }
}
