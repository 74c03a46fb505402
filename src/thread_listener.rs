//! Per-thread notification surface consumed by the compiled-in
//! instrumentation (spec §4.9).
//!
//! A `ThreadListener` is exclusively owned by the OS thread it traces (spec
//! §5: "each registered thread owns exclusive mutable access to its thread
//! listener"), so its notify* methods take `&mut self` rather than needing
//! their own locking; the state they touch on `ProcessListener` is shared
//! and goes through its own locks.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use crate::checker::{AccessKind, ContainingArea, RuntimeErrorChecker};
use crate::detect_calls::StdFunctionId;
use crate::error::{Argument, RuntimeError, RuntimeErrorKind, Severity};
use crate::event_writer::EventWriter;
use crate::output_block::{OutputBlockProcessDataStream, WriteRecord};
use crate::pointer_object::{FunctionPointerObjectMap, PointerTarget};
use crate::process_listener::ProcessListener;
use crate::sync_exit::SynchronizedExit;
use crate::trace_format::{
    Alloca, CalledFunctionOffset, Free, FunctionEnd, FunctionStart, InstructionWithDouble,
    InstructionWithFloat, InstructionWithLongDouble, InstructionWithPtr, InstructionWithUInt64,
    Malloc, NewProcessTime, PreInstruction, RuntimeError as RuntimeErrorEvent,
    RuntimeErrorArgument, StackRestore, StackRestoreAlloca, TraceEvent,
};
use crate::value_store::{BlockLayout, LongDouble, RuntimeValue, RuntimeValueStore};

/// One stack frame: the state pushed by `notify_function_begin` and popped
/// by `notify_function_end` (spec §3 "Thread state").
struct TracedFunction {
    function_index: u32,
    entry_thread_time: u64,
    value_store: RuntimeValueStore,
    pointers: FunctionPointerObjectMap,
    current_block: u32,
    previous_block: Option<u32>,
    /// Addresses and sizes of this frame's `alloca`s and byval-argument
    /// copies, used both for the return-of-local check and for shadow
    /// cleanup at function exit (spec §4.4, §4.9 `notifyFunctionEnd`).
    local_allocations: Vec<(u64, u64)>,
    stacksave_snapshots: HashMap<u64, Vec<(u64, u64)>>,
    /// This frame's own `FunctionStart` event as written, retained so
    /// `notify_function_end` can back-patch its exit fields in place (spec
    /// §4.6, §4.9 `notifyFunctionEnd` "back-patch the FunctionStart event").
    function_start: FunctionStart,
    function_start_record: WriteRecord,
}

impl TracedFunction {
    fn is_local(&self, base: u64) -> bool {
        self.local_allocations.iter().any(|&(addr, _)| addr == base)
    }

    fn stack_bytes(&self) -> u64 {
        self.local_allocations.iter().map(|&(_, size)| size).sum()
    }
}

/// Per-thread state: event writer, thread-time counter, the thread's view of
/// process time, and the active call stack (spec §3 "Thread state", §4.9).
pub struct ThreadListener<'a> {
    thread_id: u32,
    process: &'a ProcessListener,
    sync_exit: &'a SynchronizedExit,
    events: EventWriter<'a>,
    process_data: OutputBlockProcessDataStream<'a>,
    thread_time: u64,
    process_time_view: u64,
    call_stack: Vec<TracedFunction>,
    next_save_id: u64,
}

impl<'a> ThreadListener<'a> {
    pub fn new(
        process: &'a ProcessListener,
        sync_exit: &'a SynchronizedExit,
        thread_id: u32,
    ) -> io::Result<Self> {
        process.register_thread(thread_id);
        sync_exit.register(thread_id);
        #[cfg(unix)]
        if let Err(e) = crate::signal::block_on_worker_thread() {
            log::warn!("failed to block terminating signals on thread {thread_id}: {e}");
        }
        let events = EventWriter::new(&process.allocator, thread_id)?;
        process.register_thread_stream_head(thread_id, events.head_offset());
        Ok(ThreadListener {
            thread_id,
            process,
            sync_exit,
            events,
            process_data: OutputBlockProcessDataStream::new(&process.allocator),
            thread_time: 0,
            process_time_view: process.process_time(),
            call_stack: Vec::new(),
            next_save_id: 0,
        })
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn thread_time(&self) -> u64 {
        self.thread_time
    }

    fn current_frame(&self) -> &TracedFunction {
        self.call_stack.last().expect("notification received outside any function activation")
    }

    fn current_frame_mut(&mut self) -> &mut TracedFunction {
        self.call_stack.last_mut().expect("notification received outside any function activation")
    }

    /// Every notification begins by synchronizing the thread's view of
    /// process time (emitting `NewProcessTime` if it has fallen behind) and
    /// joining any stop-the-world in progress (spec §4.9, §4.12 E1).
    fn enter_notification(&mut self) -> io::Result<()> {
        self.sync_exit.check(self.thread_id);
        #[cfg(unix)]
        crate::signal::record_current_thread(self.thread_id, self.thread_time);
        let current = self.process.process_time();
        if current != self.process_time_view {
            self.write_event(NewProcessTime::new(0, current))?;
            self.process_time_view = current;
        }
        Ok(())
    }

    fn write_event<E: TraceEvent>(&mut self, event: E) -> io::Result<u64> {
        let (offset, _) = self.events.write(event)?;
        self.thread_time += 1;
        Ok(offset)
    }

    /// As `write_event`, but for events that also modify process-wide shared
    /// state (spec's `MODIFIES_SHARED_STATE` trait): bumps process time
    /// first so the emitted event's implicit ordering token is current.
    fn write_shared_event<E: TraceEvent>(&mut self, event: E) -> io::Result<u64> {
        let new_process_time = self.process.bump_process_time();
        let offset = self.write_event(event)?;
        self.process_time_view = new_process_time;
        Ok(offset)
    }

    /// As `write_shared_event`, but also returns the event as actually
    /// stamped and written, for callers that need to retain it for a later
    /// `rewrite` (e.g. `FunctionStart`'s back-patch).
    fn write_shared_event_stamped<E: TraceEvent>(&mut self, event: E) -> io::Result<(u64, E)> {
        let new_process_time = self.process.bump_process_time();
        let (offset, stamped) = self.events.write(event)?;
        self.thread_time += 1;
        self.process_time_view = new_process_time;
        Ok((offset, stamped))
    }

    fn argument_to_wire(arg: Argument) -> (u8, u64) {
        match arg {
            Argument::Address(a) => (0, a),
            Argument::Size(s) => (1, s),
            Argument::OperandIndex(i) => (2, u64::from(i)),
            Argument::ParameterIndex(i) => (3, u64::from(i)),
            Argument::Select(s) => (4, u64::from(s)),
        }
    }

    /// Writes `err` as a `RuntimeError` event followed by one
    /// `RuntimeErrorArgument` per argument, then recurses into its permanent
    /// and temporary notes in order (spec §7 "Propagation").
    pub fn record_runtime_error(&mut self, err: &RuntimeError) -> io::Result<()> {
        let severity = match err.severity() {
            Severity::Warning => 0u8,
            Severity::Fatal => 1u8,
        };
        self.write_event(RuntimeErrorEvent::new(
            0,
            err.kind() as u16,
            severity,
            err.arguments().len() as u8,
        ))?;
        for &arg in err.arguments() {
            let (ty, value) = Self::argument_to_wire(arg);
            self.write_event(RuntimeErrorArgument::new(0, ty, value))?;
        }
        for sub in err.sub_errors() {
            self.record_runtime_error(sub)?;
        }
        Ok(())
    }

    /// Records `err`; if fatal, logs and joins the synchronized-exit
    /// stop-the-world (spec §7, §4.12 E2). The caller (the instrumented
    /// call site or the process entry point) is responsible for actually
    /// terminating the process once every thread's stream is flushed.
    pub fn raise(&mut self, err: RuntimeError) -> io::Result<Option<RuntimeError>> {
        if err.is_fatal() {
            log::error!("fatal runtime error: {err}");
        } else {
            log::warn!("runtime error: {err}");
        }
        self.record_runtime_error(&err)?;
        if err.is_fatal() {
            self.sync_exit.stop_all(self.thread_id);
            Ok(Some(err))
        } else {
            Ok(None)
        }
    }

    // ---- function lifecycle ----

    /// Pushes a new frame and writes its `FunctionStart` event. Pointer
    /// arguments' tags are supplied by the caller (either propagated from
    /// the caller's own operand tags, or — for shims — the wrapped
    /// function's own argument tags) (spec §4.9 `notifyFunctionBegin`).
    pub fn notify_function_begin(
        &mut self,
        function_index: u32,
        entry_block_layout: Rc<BlockLayout>,
        pointer_args: &[(u32, PointerTarget)],
    ) -> io::Result<()> {
        self.enter_notification()?;
        let mut pointers = FunctionPointerObjectMap::new();
        for &(ssa_value, tag) in pointer_args {
            pointers.set(ssa_value, tag);
        }
        let (offset, stamped) = self.write_shared_event_stamped(FunctionStart::new(
            0,
            function_index,
            self.thread_time,
            0,
            0,
        ))?;
        let frame = TracedFunction {
            function_index,
            entry_thread_time: self.thread_time, // refreshed past the event's own tick
            value_store: RuntimeValueStore::new(entry_block_layout),
            pointers,
            current_block: 0,
            previous_block: None,
            local_allocations: Vec::new(),
            stacksave_snapshots: HashMap::new(),
            function_start: stamped,
            function_start_record: WriteRecord::new(offset, std::mem::size_of::<FunctionStart>() as u64),
        };
        if self.call_stack.last().is_some() {
            self.write_event(CalledFunctionOffset::new(0, offset))?;
        }
        self.call_stack.push(frame);
        Ok(())
    }

    /// Moves into a new basic block of the active frame, recording the old
    /// block as `previous_block` for phi resolution and installing a fresh
    /// value store for the new block's activation (spec §3 "Thread state").
    pub fn notify_block_begin(&mut self, block_index: u32, layout: Rc<BlockLayout>) {
        let frame = self.current_frame_mut();
        frame.previous_block = Some(frame.current_block);
        frame.current_block = block_index;
        frame.value_store = RuntimeValueStore::new(layout);
    }

    /// Registers a byval-argument region inside the new frame, copying
    /// shadow from the caller's source range, or marking it fully
    /// initialized if the source is unknown (spec §4.9
    /// `notifyArgumentByVal`).
    pub fn notify_argument_by_val(
        &mut self,
        _arg_index: u32,
        addr: u64,
        size: u64,
        source: Option<u64>,
    ) -> io::Result<()> {
        self.enter_notification()?;
        self.process.with_memory(|m| {
            let _ = m.add_allocation(addr, size);
            match source {
                Some(src) if m.has_known_state(src, size) => {
                    let _ = m.add(addr, size);
                }
                Some(_) => {}
                None => {
                    let _ = m.add(addr, size);
                }
            }
        });
        if let Some(src) = source {
            self.process.with_pointers(|p| p.copy_range(src, addr, size));
        }
        self.current_frame_mut().local_allocations.push((addr, size));
        self.write_event(crate::trace_format::ByValRegionAdd::new(0, addr, size))?;
        Ok(())
    }

    /// At `main` entry only: registers `argv` and each pointed-to string,
    /// populating the in-memory pointer-object map for their slots (spec
    /// §4.9 `notifyArgs`).
    pub fn notify_args(&mut self, argv_array_addr: u64, ptr_size: u64, entries: &[(u64, u64)]) {
        self.process.with_pointers(|pointers| {
            for (i, &(entry_addr, _len)) in entries.iter().enumerate() {
                let slot = argv_array_addr + (i as u64) * ptr_size;
                pointers.set(slot, ptr_size, self.process.temporal_ids().mint(entry_addr));
            }
        });
    }

    /// As `notify_args`, for `envp` (spec §4.9 `notifyEnv`).
    pub fn notify_env(&mut self, envp_array_addr: u64, ptr_size: u64, entries: &[(u64, u64)]) {
        self.notify_args(envp_array_addr, ptr_size, entries)
    }

    /// Checks a returned pointer for return-of-local, clears the frame's
    /// local shadow, pops it, and writes `FunctionEnd` (spec §4.9
    /// `notifyFunctionEnd`). `returned_pointer` is `Some(tag)` only when the
    /// terminator returns a pointer-typed value. Returns a fatal
    /// `RuntimeError` if return-of-local was detected; the caller must
    /// `raise` it.
    pub fn notify_function_end(
        &mut self,
        returned_pointer: Option<PointerTarget>,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        let error = if let Some(tag) = returned_pointer {
            let frame = self.current_frame();
            if !tag.is_null() && frame.is_local(tag.base()) {
                Some(RuntimeError::new(
                    RuntimeErrorKind::ReturnOfLocal,
                    Severity::Fatal,
                    vec![Argument::Address(tag.base())],
                ))
            } else {
                None
            }
        } else {
            None
        };

        let frame = self.call_stack.pop().expect("function end without a matching begin");
        self.process.with_memory(|m| {
            for &(addr, _) in &frame.local_allocations {
                m.remove_allocation(addr);
            }
        });
        self.process.with_pointers(|p| {
            for &(addr, size) in &frame.local_allocations {
                p.clear_range(addr, size);
            }
        });
        let process_time = self.process.process_time();
        let end_offset = self.write_shared_event(FunctionEnd::new(0, self.thread_time, process_time))?;

        // Back-patch the FunctionStart event now that the exit details are
        // known (spec §4.6, §4.9 "back-patch the FunctionStart event").
        let mut patched = frame.function_start;
        patched.end_thread_time = self.thread_time;
        patched.end_offset = end_offset;
        self.events.rewrite(frame.function_start_record, patched)?;

        if let Some(err) = error {
            return self.raise(err);
        }
        Ok(None)
    }

    // ---- calls ----

    /// Writes the call's `PreInstruction` marker and dispatches through the
    /// call-site detector (spec §4.9 `notifyPreCall`).
    pub fn notify_pre_call(&mut self, instruction_index: u32, callee_addr: u64) -> io::Result<Option<StdFunctionId>> {
        self.enter_notification()?;
        self.write_event(PreInstruction::new(0, instruction_index))?;
        Ok(self.process.call_sites.read().unwrap().check(callee_addr))
    }

    /// The call's result is recorded by a subsequent `notify_value_*` call;
    /// this only re-synchronizes the thread's process-time view after the
    /// (possibly long-running) call returns (spec §4.9 `notifyPostCall`).
    pub fn notify_post_call(&mut self) -> io::Result<()> {
        self.enter_notification()
    }

    // ---- intrinsics ----

    /// `memcpy`/`memmove` semantics: both observed as a direction-correct
    /// `memmove` for determinism (spec scenario 5). Detects (as a warning,
    /// not a failure) source/destination overlap.
    pub fn notify_call_intrinsic_memmove(
        &mut self,
        instruction_index: u32,
        dst: u64,
        src: u64,
        len: u64,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        self.write_event(PreInstruction::new(0, instruction_index))?;

        let overlap = src < dst + len && dst < src + len;
        let mut warning = None;
        if overlap {
            warning = Some(RuntimeError::new(
                RuntimeErrorKind::OverlappingSourceDestination,
                Severity::Warning,
                vec![Argument::Address(dst), Argument::Size(len)],
            ));
        }

        self.process.with_memory(|m| {
            let _ = m.memmove(src, dst, len);
        });
        self.process.with_pointers(|p| p.copy_range(src, dst, len));
        self.write_event(crate::trace_format::StateMemmove::new(0, src, dst, len))?;

        if let Some(w) = warning {
            return self.raise(w);
        }
        Ok(None)
    }

    /// `memset`: clears pointer-object entries in the written range (a raw
    /// byte fill can never leave a valid pointer behind) and marks the
    /// range's shadow initialized.
    pub fn notify_call_intrinsic_memset(&mut self, instruction_index: u32, dst: u64, len: u64) -> io::Result<()> {
        self.enter_notification()?;
        self.write_event(PreInstruction::new(0, instruction_index))?;
        self.process.with_memory(|m| {
            let _ = m.add(dst, len);
        });
        self.process.with_pointers(|p| p.clear_range(dst, len));
        self.write_event(crate::trace_format::StateClear::new(0, dst, len))?;
        Ok(())
    }

    /// Snapshots the active frame's current allocations, returning an
    /// opaque save ID for a matching `stackrestore` (spec §4.9
    /// `notifyPreCallIntrinsic` "stacksave").
    pub fn notify_stacksave(&mut self, instruction_index: u32) -> io::Result<u64> {
        self.enter_notification()?;
        let save_id = self.next_save_id;
        self.next_save_id += 1;
        let snapshot = self.current_frame().local_allocations.clone();
        self.current_frame_mut().stacksave_snapshots.insert(save_id, snapshot);
        self.write_event(StackRestore::new(0, instruction_index, save_id))?;
        Ok(save_id)
    }

    /// Invalidates and removes every allocation added since `save_id`'s
    /// snapshot, writing one `StackRestoreAlloca` per removed allocation
    /// (spec §4.9 `notifyPreCallIntrinsic` "stackrestore").
    pub fn notify_stackrestore(&mut self, instruction_index: u32, save_id: u64) -> io::Result<()> {
        self.enter_notification()?;
        let snapshot = self
            .current_frame()
            .stacksave_snapshots
            .get(&save_id)
            .cloned()
            .unwrap_or_default();
        let current = self.current_frame().local_allocations.clone();
        let removed: Vec<(u64, u64)> =
            current.iter().filter(|entry| !snapshot.contains(entry)).copied().collect();

        for &(addr, size) in &removed {
            self.process.with_memory(|m| m.remove_allocation(addr));
            self.process.with_pointers(|p| p.clear_range(addr, size));
            self.write_event(StackRestoreAlloca::new(0, addr))?;
        }
        self.current_frame_mut().local_allocations = snapshot;
        self.write_shared_event(StackRestore::new(0, instruction_index, save_id))?;
        Ok(())
    }

    // ---- alloca ----

    /// Detects stack exhaustion *before* the allocation happens, comparing
    /// the frame's cumulative alloca size against `stack_quota` (spec B3).
    pub fn notify_pre_alloca(
        &mut self,
        elem_size: u64,
        count: u64,
        stack_quota: u64,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        let requested = elem_size.saturating_mul(count);
        let used: u64 = self.call_stack.iter().map(TracedFunction::stack_bytes).sum();
        if used.saturating_add(requested) > stack_quota {
            let err = RuntimeError::new(RuntimeErrorKind::StackOverflow, Severity::Fatal, vec![Argument::Size(requested)]);
            return self.raise(err);
        }
        Ok(None)
    }

    /// Registers the alloca's allocation, mints its pointer tag, and writes
    /// the `Alloca` event (spec §4.4 "alloca").
    pub fn notify_alloca(&mut self, instruction_index: u32, address: u64, size: u64) -> io::Result<PointerTarget> {
        self.process.with_memory(|m| {
            let _ = m.add_allocation(address, size);
        });
        let tag = self.process.temporal_ids().mint(address);
        self.current_frame_mut().local_allocations.push((address, size));
        self.write_shared_event(Alloca::new(0, instruction_index, address, size))?;
        Ok(tag)
    }

    // ---- load / store ----

    /// Validates the pointer tag and the shadow-initialization of
    /// `[addr, addr+size)` (spec §4.9 `notifyPreLoad`).
    pub fn notify_pre_load(
        &mut self,
        addr: u64,
        size: u64,
        tag: PointerTarget,
        area: &ContainingArea<'_>,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        if let Err(e) = RuntimeErrorChecker::check_pointer(tag, addr, self.process.temporal_ids()) {
            return self.raise(e);
        }
        if let Err(e) = RuntimeErrorChecker::check_memory_access(addr, size, AccessKind::Read, area) {
            return self.raise(e);
        }
        Ok(None)
    }

    /// On success, propagates the in-memory pointer-object tag at `addr` to
    /// the loaded SSA value (spec §4.9 `notifyPostLoad`, only meaningful for
    /// pointer-typed loads).
    pub fn notify_post_load_ptr(&mut self, addr: u64) -> PointerTarget {
        self.process.with_pointers(|p| p.get(addr))
    }

    /// Validates the pointer tag and writability of `[addr, addr+size)`
    /// (spec §4.9 `notifyPreStore`).
    pub fn notify_pre_store(
        &mut self,
        addr: u64,
        size: u64,
        tag: PointerTarget,
        area: &ContainingArea<'_>,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        if let Err(e) = RuntimeErrorChecker::check_pointer(tag, addr, self.process.temporal_ids()) {
            return self.raise(e);
        }
        if let Err(e) = RuntimeErrorChecker::check_memory_access(addr, size, AccessKind::Write, area) {
            return self.raise(e);
        }
        Ok(None)
    }

    /// Records shadow initialization for the stored span (spec §4.9
    /// `notifyPostStore`).
    pub fn notify_post_store(&mut self, addr: u64, size: u64) -> io::Result<()> {
        self.process.with_memory(|m| {
            let _ = m.add(addr, size);
        });
        self.write_event(crate::trace_format::StateUntypedSmall::new(0, addr, size.min(255) as u8, 0))?;
        Ok(())
    }

    /// For a pointer-typed store, commits `value_tag` into the in-memory
    /// pointer-object map at `addr`, clearing any stale overlap (spec §4.4
    /// "Store of a pointer type").
    pub fn notify_post_store_ptr(&mut self, addr: u64, ptr_size: u64, value_tag: PointerTarget) {
        self.process.with_pointers(|p| p.set(addr, ptr_size, value_tag));
    }

    // ---- pointer arithmetic ----

    /// Validates a `getelementptr` result before it becomes a pointer value
    /// (spec §4.4 "Validation rules"): the base tag must be temporally
    /// current, and the resulting address must land within the base
    /// allocation or exactly one-past-its-end (spec boundary behaviour B1).
    pub fn notify_pre_gep(
        &mut self,
        base_tag: PointerTarget,
        base_addr: u64,
        result_addr: u64,
        area: &ContainingArea<'_>,
    ) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        if let Err(e) = RuntimeErrorChecker::check_pointer(base_tag, base_addr, self.process.temporal_ids()) {
            return self.raise(e);
        }
        let range = match area {
            ContainingArea::Allocation(range, _) => *range,
            ContainingArea::Known(known) => known.range(),
            ContainingArea::None => {
                let err = RuntimeError::new(
                    RuntimeErrorKind::PointerArithmeticOnInvalidOperand,
                    Severity::Fatal,
                    vec![Argument::Address(base_addr)],
                );
                return self.raise(err);
            }
        };
        if !range.contains_value_or_end(result_addr) {
            let err = RuntimeError::new(
                RuntimeErrorKind::PointerArithmeticResultInvalid,
                Severity::Fatal,
                vec![Argument::Address(base_addr), Argument::Address(result_addr)],
            );
            return self.raise(err);
        }
        Ok(None)
    }

    // ---- division ----

    /// Validates a non-zero integer divisor *before* the division is
    /// performed (spec B2).
    pub fn notify_pre_divide_int(&mut self, divisor: i64) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        if divisor == 0 {
            let err = RuntimeError::new(RuntimeErrorKind::DivisionByZero, Severity::Fatal, vec![]);
            return self.raise(err);
        }
        Ok(None)
    }

    /// As `notify_pre_divide_int`, for floating-point division/remainder.
    pub fn notify_pre_divide_float(&mut self, divisor: f64) -> io::Result<Option<RuntimeError>> {
        self.enter_notification()?;
        if divisor == 0.0 {
            let err = RuntimeError::new(RuntimeErrorKind::DivisionByZero, Severity::Fatal, vec![]);
            return self.raise(err);
        }
        Ok(None)
    }

    // ---- value recording ----

    pub fn notify_value_int(&mut self, instruction_index: u32, value: u64) -> io::Result<()> {
        self.current_frame_mut().value_store.record_int(instruction_index as usize, value);
        self.write_event(InstructionWithUInt64::new(0, instruction_index, value))?;
        Ok(())
    }

    pub fn notify_value_float(&mut self, instruction_index: u32, value: f32) -> io::Result<()> {
        self.current_frame_mut().value_store.record_float(instruction_index as usize, value);
        self.write_event(InstructionWithFloat::new(0, instruction_index, value))?;
        Ok(())
    }

    pub fn notify_value_double(&mut self, instruction_index: u32, value: f64) -> io::Result<()> {
        self.current_frame_mut().value_store.record_double(instruction_index as usize, value);
        self.write_event(InstructionWithDouble::new(0, instruction_index, value))?;
        Ok(())
    }

    pub fn notify_value_long_double(&mut self, instruction_index: u32, value: LongDouble) -> io::Result<()> {
        self.current_frame_mut().value_store.record_long_double(instruction_index as usize, value);
        let data_offset = self.process.record_data(&self.process_data, value.as_bytes())?;
        self.write_event(InstructionWithLongDouble::new(0, instruction_index, data_offset))?;
        Ok(())
    }

    pub fn notify_value_ptr(&mut self, instruction_index: u32, address: u64, tag: PointerTarget) -> io::Result<()> {
        self.current_frame_mut().value_store.record_ptr(instruction_index as usize, address);
        self.current_frame_mut().pointers.set(instruction_index, tag);
        self.write_event(InstructionWithPtr::new(0, instruction_index, address))?;
        Ok(())
    }

    pub fn value_of(&self, instruction_index: u32) -> Option<RuntimeValue> {
        self.current_frame().value_store.get(instruction_index as usize)
    }

    pub fn pointer_tag_of(&self, ssa_value: u32) -> PointerTarget {
        self.current_frame().pointers.get(ssa_value)
    }

    // ---- malloc / free ----

    pub fn notify_malloc(&mut self, instruction_index: u32, address: u64, size: u64) -> io::Result<PointerTarget> {
        self.process.record_malloc(address, size);
        let tag = self.process.temporal_ids().mint(address);
        self.write_shared_event(Malloc::new(0, instruction_index, address, size))?;
        Ok(tag)
    }

    pub fn notify_free(&mut self, instruction_index: u32, address: u64) -> io::Result<()> {
        self.process.record_free(address);
        self.process.temporal_ids().bump(address);
        self.write_shared_event(Free::new(0, instruction_index, address))?;
        Ok(())
    }
}

impl Drop for ThreadListener<'_> {
    fn drop(&mut self) {
        let _ = self.events.write_trace_end();
        self.sync_exit.deregister(self.thread_id);
        self.process.deregister_thread(self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceConfig;
    use crate::interval::Permission;
    use crate::output_block::OutputStreamAllocator;
    use crate::value_store::{BlockLayout, SlotKind};
    use tempfile::tempfile;

    fn listener() -> ProcessListener {
        let alloc = OutputStreamAllocator::create(tempfile().unwrap()).unwrap();
        ProcessListener::new(TraceConfig::default(), alloc)
    }

    fn entry_layout() -> Rc<BlockLayout> {
        let mut b = BlockLayout::builder();
        b.reserve(SlotKind::Int64);
        b.reserve(SlotKind::Int64);
        Rc::new(b.build())
    }

    #[test]
    fn function_begin_and_end_round_trip() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        assert_eq!(t.thread_time(), 1);
        let result = t.notify_function_end(None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn return_of_local_is_fatal() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        t.notify_alloca(0, 0x7000, 8).unwrap();
        let tag = process.temporal_ids().current(0x7000);
        let local_tag = PointerTarget::new(0x7000, tag);
        let err = t.notify_function_end(Some(local_tag)).unwrap();
        assert_eq!(err.unwrap().kind(), RuntimeErrorKind::ReturnOfLocal);
    }

    #[test]
    fn returning_callers_stack_is_not_local() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let foreign_tag = PointerTarget::new(0x9000, 1);
        let err = t.notify_function_end(Some(foreign_tag)).unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn pre_alloca_detects_overflow_before_allocating() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let err = t.notify_pre_alloca(1024, 1, 512).unwrap();
        assert_eq!(err.unwrap().kind(), RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn pre_divide_rejects_zero_before_division() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let err = t.notify_pre_divide_int(0).unwrap();
        assert_eq!(err.unwrap().kind(), RuntimeErrorKind::DivisionByZero);
        assert!(t.notify_pre_divide_int(2).unwrap().is_none());
    }

    #[test]
    fn value_recording_round_trips() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        t.notify_value_int(0, 42).unwrap();
        assert_eq!(t.value_of(0), Some(RuntimeValue::Int(42)));
    }

    #[test]
    fn overlapping_memmove_raises_warning_but_continues() {
        let process = listener();
        process.with_memory(|m| m.add_allocation(0x1000, 16).unwrap());
        process.with_memory(|m| m.add(0x1000, 8).unwrap());
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let warning = t.notify_call_intrinsic_memmove(0, 0x1001, 0x1000, 5).unwrap();
        assert_eq!(warning.unwrap().kind(), RuntimeErrorKind::OverlappingSourceDestination);
        assert!(process.with_memory(|m| m.has_known_state(0x1001, 5)));
    }

    #[test]
    fn stackrestore_removes_allocations_added_after_save() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        t.notify_alloca(0, 0x2000, 8).unwrap();
        let save_id = t.notify_stacksave(1).unwrap();
        t.notify_alloca(2, 0x2010, 8).unwrap();
        assert!(process.with_memory(|m| m.find_allocation_containing(0x2010).is_some()));
        t.notify_stackrestore(3, save_id).unwrap();
        assert!(process.with_memory(|m| m.find_allocation_containing(0x2010).is_none()));
        assert!(process.with_memory(|m| m.find_allocation_containing(0x2000).is_some()));
    }

    #[test]
    fn known_region_load_respects_permission() {
        let process = listener();
        process.add_known_region(0x5000, 0x5010, Permission::ReadOnly);
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let area = ContainingArea::Known(crate::interval::MemoryArea::new(0x5000, 0x5010, Permission::ReadOnly));
        let tag = process.temporal_ids().mint(0x5000);
        let err = t.notify_pre_load(0x5000, 4, tag, &area).unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn gep_accepts_result_exactly_at_allocation_end() {
        let process = listener();
        process.with_memory(|m| m.add_allocation(0x3000, 16).unwrap());
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let tag = process.temporal_ids().mint(0x3000);
        let err = process.with_memory(|m| {
            let area = ContainingArea::Allocation(crate::interval::Interval::new(0x3000, 0x3010), m);
            t.notify_pre_gep(tag, 0x3000, 0x3010, &area)
        });
        assert!(err.unwrap().is_none());
    }

    #[test]
    fn gep_rejects_result_past_allocation_end() {
        let process = listener();
        process.with_memory(|m| m.add_allocation(0x3000, 16).unwrap());
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let tag = process.temporal_ids().mint(0x3000);
        let err = process.with_memory(|m| {
            let area = ContainingArea::Allocation(crate::interval::Interval::new(0x3000, 0x3010), m);
            t.notify_pre_gep(tag, 0x3000, 0x3011, &area)
        });
        assert_eq!(err.unwrap().unwrap().kind(), RuntimeErrorKind::PointerArithmeticResultInvalid);
    }

    #[test]
    fn gep_rejects_stale_base_tag() {
        let process = listener();
        process.with_memory(|m| m.add_allocation(0x3000, 16).unwrap());
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let tag = process.temporal_ids().mint(0x3000);
        process.temporal_ids().bump(0x3000);
        let err = process.with_memory(|m| {
            let area = ContainingArea::Allocation(crate::interval::Interval::new(0x3000, 0x3010), m);
            t.notify_pre_gep(tag, 0x3000, 0x3008, &area)
        });
        assert_eq!(err.unwrap().unwrap().kind(), RuntimeErrorKind::PointerArithmeticOperandOutdated);
    }

    #[test]
    fn function_start_is_back_patched_with_exit_details() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        let record = t.call_stack.last().unwrap().function_start_record;
        t.notify_function_end(None).unwrap();

        let mut buf = [0u8; std::mem::size_of::<FunctionStart>()];
        process.allocator.read_at(record.offset(), &mut buf).unwrap();
        // SAFETY: `FunctionStart` is `#[repr(C)]` plain-old-data, same as the
        // reinterpretation `as_bytes` performs in the other direction.
        let patched: FunctionStart = unsafe { std::ptr::read(buf.as_ptr() as *const FunctionStart) };
        assert_eq!(patched.function_index, 0);
        assert_ne!(patched.end_thread_time, 0);
        assert_ne!(patched.end_offset, 0);
    }

    #[test]
    fn called_function_offset_is_emitted_for_nested_calls() {
        let process = listener();
        let sync = SynchronizedExit::new();
        let mut t = ThreadListener::new(&process, &sync, 1).unwrap();
        t.notify_function_begin(0, entry_layout(), &[]).unwrap();
        assert_eq!(t.thread_time(), 1);
        t.notify_function_begin(1, entry_layout(), &[]).unwrap();
        assert_eq!(t.thread_time(), 3);
    }
}
