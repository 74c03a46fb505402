//! `WrapCstdlib_h`: `malloc`/`calloc`/`realloc`/`free`, the `ato*`/`strtol`
//! family, and `getenv` (spec-full §4.13).

use std::io;
use std::os::raw::{c_char, c_int, c_void};

use crate::error::{Argument, RuntimeError, RuntimeErrorKind, Severity};
use crate::pointer_object::PointerTarget;

use super::{RawArgs, RawResult, ShimCall};

pub fn malloc(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, size) = (args[0] as u32, args[1]);
    let addr = unsafe { libc::malloc(size as usize) } as u64;
    let tag = if addr != 0 { call.record_malloc(instr, addr, size)? } else { PointerTarget::NULL };
    call.listener.notify_value_ptr(instr, addr, tag)?;
    Ok(Some(addr))
}

pub fn calloc(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, nmemb, size) = (args[0] as u32, args[1], args[2]);
    let addr = unsafe { libc::calloc(nmemb as usize, size as usize) } as u64;
    let total = nmemb.saturating_mul(size);
    let tag = if addr != 0 { call.record_malloc(instr, addr, total)? } else { PointerTarget::NULL };
    call.listener.notify_value_ptr(instr, addr, tag)?;
    Ok(Some(addr))
}

pub fn realloc(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, ptr, size) = (args[0] as u32, args[1], args[2]);
    if ptr != 0 && !call.process.is_dynamic_allocation(ptr) {
        let err = RuntimeError::new(
            RuntimeErrorKind::PassedPointerToUnowned,
            Severity::Fatal,
            vec![Argument::Address(ptr)],
        );
        call.listener.raise(err)?;
        return Ok(None);
    }
    if ptr != 0 {
        call.record_free(instr, ptr)?;
    }
    let new_addr = unsafe { libc::realloc(ptr as *mut c_void, size as usize) } as u64;
    let tag =
        if new_addr != 0 { call.record_malloc(instr, new_addr, size)? } else { PointerTarget::NULL };
    call.listener.notify_value_ptr(instr, new_addr, tag)?;
    Ok(Some(new_addr))
}

pub fn free(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, ptr) = (args[0] as u32, args[1]);
    if ptr == 0 {
        return Ok(Some(0));
    }
    if !call.process.is_dynamic_allocation(ptr) {
        let err = RuntimeError::new(
            RuntimeErrorKind::PassedPointerToUnowned,
            Severity::Fatal,
            vec![Argument::Address(ptr)],
        );
        call.listener.raise(err)?;
        return Ok(None);
    }
    unsafe {
        libc::free(ptr as *mut c_void);
    }
    call.record_free(instr, ptr)?;
    Ok(Some(0))
}

pub fn atoi(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, s) = (args[0] as u32, args[1]);
    if call.check_c_string(0, s)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::atoi(s as *const c_char) };
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}

pub fn atol(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, s) = (args[0] as u32, args[1]);
    if call.check_c_string(0, s)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::atol(s as *const c_char) };
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}

pub fn strtol(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, s, endptr_addr, base) = (args[0] as u32, args[1], args[2], args[3] as c_int);
    if call.check_c_string(0, s)?.is_none() {
        return Ok(None);
    }
    if endptr_addr != 0 && !call.check_write(1, endptr_addr, 8)? {
        return Ok(None);
    }
    let mut endptr: *mut c_char = std::ptr::null_mut();
    let result = unsafe { libc::strtol(s as *const c_char, &mut endptr as *mut *mut c_char, base) };
    if endptr_addr != 0 {
        unsafe {
            std::ptr::write(endptr_addr as *mut u64, endptr as u64);
        }
        call.record_write(endptr_addr, 8)?;
        let tag = call.tag_for(endptr as u64);
        call.listener.notify_post_store_ptr(endptr_addr, 8, tag);
    }
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}

pub fn getenv(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, name) = (args[0] as u32, args[1]);
    if call.check_c_string(0, name)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::getenv(name as *const c_char) } as u64;
    let tag = if result != 0 {
        let len = unsafe { libc::strlen(result as *const c_char) };
        call.record_internal_static(result, len as u64 + 1);
        PointerTarget::new(result, 0)
    } else {
        PointerTarget::NULL
    };
    call.listener.notify_value_ptr(instr, result, tag)?;
    Ok(Some(result))
}
