//! Library-call interception framework (spec §4.11) and its catalogue of
//! concretely wrapped standard-library functions (spec-full §4.13).
//!
//! Each wrapped function runs a shim with the same signature in place of the
//! original: enter the notification, check the declared arguments, invoke
//! the real function, classify and record the result, notify the thread
//! listener, exit the notification. `ShimCall` bundles the services common
//! to every shim so each function body only names its own argument roles,
//! mirroring the way the teacher's `FileDescription` trait (`shims/unix/fd.rs`)
//! factors per-descriptor behaviour out of a shared dispatch surface.

pub mod cstdio;
pub mod cstdlib;
pub mod cstring;
pub mod dirent;
pub mod errno;
pub mod locale;
pub mod unistd;

use std::io;

use crate::checker::{self, AccessKind, CStdLibChecker, ContainingArea, RuntimeErrorChecker};
use crate::detect_calls::StdFunctionId;
use crate::error::{Argument, RuntimeError};
use crate::interval::{Interval, Permission};
use crate::pointer_object::PointerTarget;
use crate::process_listener::{ContainingAreaOwned, ProcessListener, StackAreaProvider};
use crate::thread_listener::ThreadListener;

/// Placeholder stack-area lookup: this crate does not (yet) register worker
/// threads' own stack bounds, so shims only search globals, dynamic
/// allocations and known regions (spec §4.10's first three search steps).
struct NoStackAreas;

impl StackAreaProvider for NoStackAreas {
    fn stack_area_for(&self, _thread_id: u32) -> Option<Interval<u64>> {
        None
    }
}

/// Bundles the per-invocation services a shim needs (spec §4.11 steps 1-8):
/// the calling thread's listener, the shared process state, and the
/// function name errors are attributed to.
pub struct ShimCall<'t, 'a> {
    pub listener: &'t mut ThreadListener<'a>,
    pub process: &'a ProcessListener,
    pub function: &'static str,
}

impl<'t, 'a> ShimCall<'t, 'a> {
    pub fn new(listener: &'t mut ThreadListener<'a>, process: &'a ProcessListener, function: &'static str) -> Self {
        ShimCall { listener, process, function }
    }

    fn checker(&self) -> CStdLibChecker<'_> {
        CStdLibChecker::new(self.function)
    }

    /// Attributes `err` to `parameter_index` of this shim's function, the way
    /// `CStdLibChecker::tag` does for its own string/array checks (spec §4.8).
    fn attribute(&self, parameter_index: u32, mut err: RuntimeError) -> RuntimeError {
        err.arguments_mut().push(Argument::ParameterIndex(parameter_index));
        err
    }

    fn with_area<R>(&self, addr: u64, f: impl FnOnce(&ContainingArea<'_>) -> R) -> R {
        let owned =
            self.process.get_containing_memory_area(addr, &NoStackAreas, self.listener.thread_id(), &[]);
        self.process.with_memory(|m| f(&owned.as_checker_area(m)))
    }

    /// Step 3 for a plain input pointer: validated readable for `size` bytes.
    pub fn check_read(&mut self, parameter_index: u32, addr: u64, size: u64) -> io::Result<bool> {
        let result = self.with_area(addr, |area| {
            RuntimeErrorChecker::check_memory_access(addr, size, AccessKind::Read, area)
        });
        self.finish_check(parameter_index, result)
    }

    /// Step 3 for a plain output pointer: validated writable for `size` bytes.
    pub fn check_write(&mut self, parameter_index: u32, addr: u64, size: u64) -> io::Result<bool> {
        let result = self.with_area(addr, |area| {
            RuntimeErrorChecker::check_memory_access(addr, size, AccessKind::Write, area)
        });
        self.finish_check(parameter_index, result)
    }

    /// Step 3 for an input C string: validated NUL-terminated and readable.
    /// Returns the string's length excluding the terminator on success.
    pub fn check_c_string(&mut self, parameter_index: u32, addr: u64) -> io::Result<Option<u64>> {
        let checker = self.checker();
        let result = self.with_area(addr, |area| checker.check_c_string_read(parameter_index, addr, area));
        match result {
            Ok(len_with_terminator) => Ok(Some(len_with_terminator - 1)),
            Err(e) => {
                self.listener.raise(e)?;
                Ok(None)
            }
        }
    }

    /// As `check_c_string`, bounded by a caller-supplied length (`strncpy`'s
    /// `n`, `fgets`'s buffer size).
    pub fn check_limited_c_string(
        &mut self,
        parameter_index: u32,
        addr: u64,
        bound: u64,
    ) -> io::Result<Option<u64>> {
        let checker = self.checker();
        let result =
            self.with_area(addr, |area| checker.check_limited_c_string_read(parameter_index, addr, bound, area));
        match result {
            Ok(len) => Ok(Some(len)),
            Err(e) => {
                self.listener.raise(e)?;
                Ok(None)
            }
        }
    }

    fn finish_check(&mut self, parameter_index: u32, result: Result<(), RuntimeError>) -> io::Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                let err = self.attribute(parameter_index, e);
                self.listener.raise(err)?;
                Ok(false)
            }
        }
    }

    /// Step 6 for an output pointer: commits shadow-initialized state for
    /// the written span.
    pub fn record_write(&mut self, addr: u64, size: u64) -> io::Result<()> {
        self.process.with_memory(|m| {
            let _ = m.add(addr, size);
        });
        self.listener.notify_post_store(addr, size)
    }

    /// Step 6 for a new allocation (`malloc`/`calloc`/`realloc`/`fopen`'s
    /// `FILE*`, `opendir`'s `DIR*`): feeds the dynamic-allocation map.
    pub fn record_malloc(&mut self, instruction_index: u32, address: u64, size: u64) -> io::Result<PointerTarget> {
        self.listener.notify_malloc(instruction_index, address, size)
    }

    pub fn record_free(&mut self, instruction_index: u32, address: u64) -> io::Result<()> {
        self.listener.notify_free(instruction_index, address)
    }

    /// Step 6 for an internal-static result (`localeconv`, `strerror`,
    /// `__errno_location`): marks the returned region as known and
    /// read-only, since the tracer does not own its shadow.
    pub fn record_internal_static(&self, addr: u64, size: u64) {
        self.process.add_known_region(addr, addr + size, Permission::ReadOnly);
    }

    /// The pointer-provenance tag for a result address that falls inside a
    /// known allocation (e.g. `strchr`'s return, a pointer `read` into a
    /// caller buffer carries no new tag of its own): resolves the
    /// allocation's base and mints/returns its current temporal ID. `0`
    /// always maps to `PointerTarget::NULL`.
    pub fn tag_for(&self, addr: u64) -> PointerTarget {
        if addr == 0 {
            return PointerTarget::NULL;
        }
        let owned = self.process.get_containing_memory_area(addr, &NoStackAreas, self.listener.thread_id(), &[]);
        match owned {
            ContainingAreaOwned::Allocation(range) => {
                PointerTarget::new(range.start(), self.process.temporal_ids().current(range.start()))
            }
            _ => PointerTarget::NULL,
        }
    }

    /// Reads bytes already validated by a prior `check_read`/`check_c_string`
    /// call on this same span.
    ///
    /// # Safety
    /// Callers must only pass a range this `ShimCall` has already validated.
    pub unsafe fn read_checked(&self, addr: u64, len: u64) -> Vec<u8> {
        unsafe { checker::read_bytes(addr, len) }
    }
}

/// Dispatches a call detected at `callee` (spec §4.7) to its shim, if known.
/// Returns `false` if `callee` is not one of the intercepted functions, in
/// which case the instrumentation leaves the call unmediated.
pub fn dispatch(id: StdFunctionId, call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    use StdFunctionId::*;
    match id {
        Memcpy => cstring::memcpy(call, args),
        Memmove => cstring::memmove(call, args),
        Memset => cstring::memset(call, args),
        Strlen => cstring::strlen(call, args),
        Strcpy => cstring::strcpy(call, args),
        Strncpy => cstring::strncpy(call, args),
        Strcat => cstring::strcat(call, args),
        Strncat => cstring::strncat(call, args),
        Strcmp => cstring::strcmp(call, args),
        Strncmp => cstring::strncmp(call, args),
        Strchr => cstring::strchr(call, args),
        Strstr => cstring::strstr(call, args),
        Malloc => cstdlib::malloc(call, args),
        Calloc => cstdlib::calloc(call, args),
        Realloc => cstdlib::realloc(call, args),
        Free => cstdlib::free(call, args),
        Atoi => cstdlib::atoi(call, args),
        Atol => cstdlib::atol(call, args),
        Strtol => cstdlib::strtol(call, args),
        Getenv => cstdlib::getenv(call, args),
        Fopen => cstdio::fopen(call, args),
        Fclose => cstdio::fclose(call, args),
        Fread => cstdio::fread(call, args),
        Fwrite => cstdio::fwrite(call, args),
        Fgets => cstdio::fgets(call, args),
        Fputs => cstdio::fputs(call, args),
        Printf | Fprintf | Sprintf | Snprintf => cstdio::printf_family(call, args),
        Scanf | Fscanf | Sscanf => cstdio::scanf_family(call, args),
        Opendir => dirent::opendir(call, args),
        Readdir => dirent::readdir(call, args),
        Closedir => dirent::closedir(call, args),
        Read => unistd::read(call, args),
        Write => unistd::write(call, args),
        Close => unistd::close(call, args),
        Localeconv => locale::localeconv(call, args),
        Setlocale => locale::setlocale(call, args),
        Strerror => errno::strerror(call, args),
        ErrnoLocation => errno::errno_location(call, args),
    }
}

/// A shim's raw arguments: each slot is a 64-bit word (address, integer, or
/// scalar bit pattern), matching the ABI-level view the instrumentation
/// thunk passes through (spec §4.11 "a shim with the same signature").
pub type RawArgs = Vec<u64>;

/// A shim's raw result word, `None` if the intercepted call diverges
/// (e.g. a fatal error already triggered synchronized exit).
pub type RawResult = Option<u64>;
