//! `WrapCstring_h`: `memcpy`/`memmove`/`memset` and the `str*` family
//! (spec-full §4.13).
//!
//! `args[0]` is always the instruction index the call site tags its result
//! with; the remaining slots are the function's own arguments, in order.

use std::io;
use std::os::raw::{c_char, c_int, c_void};

use super::{RawArgs, RawResult, ShimCall};

pub fn memcpy(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src, len) = (args[0] as u32, args[1], args[2], args[3]);
    if !call.check_read(1, src, len)? || !call.check_write(0, dst, len)? {
        return Ok(None);
    }
    unsafe {
        libc::memcpy(dst as *mut c_void, src as *const c_void, len as usize);
    }
    // Shadow-state update is identical to `memmove` (spec P3); the tracer
    // does not itself distinguish overlapping from non-overlapping copies.
    call.listener.notify_call_intrinsic_memmove(instr, dst, src, len)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn memmove(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src, len) = (args[0] as u32, args[1], args[2], args[3]);
    if !call.check_read(1, src, len)? || !call.check_write(0, dst, len)? {
        return Ok(None);
    }
    unsafe {
        libc::memmove(dst as *mut c_void, src as *const c_void, len as usize);
    }
    call.listener.notify_call_intrinsic_memmove(instr, dst, src, len)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn memset(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, value, len) = (args[0] as u32, args[1], args[2] as c_int, args[3]);
    if !call.check_write(0, dst, len)? {
        return Ok(None);
    }
    unsafe {
        libc::memset(dst as *mut c_void, value, len as usize);
    }
    call.listener.notify_call_intrinsic_memset(instr, dst, len)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn strlen(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, s) = (args[0] as u32, args[1]);
    let Some(len) = call.check_c_string(0, s)? else { return Ok(None) };
    call.listener.notify_value_int(instr, len)?;
    Ok(Some(len))
}

pub fn strcpy(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src) = (args[0] as u32, args[1], args[2]);
    let Some(src_len) = call.check_c_string(1, src)? else { return Ok(None) };
    if !call.check_write(0, dst, src_len + 1)? {
        return Ok(None);
    }
    unsafe {
        libc::strcpy(dst as *mut c_char, src as *const c_char);
    }
    call.record_write(dst, src_len + 1)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn strncpy(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src, n) = (args[0] as u32, args[1], args[2], args[3]);
    if call.check_limited_c_string(1, src, n)?.is_none() {
        return Ok(None);
    }
    if !call.check_write(0, dst, n)? {
        return Ok(None);
    }
    unsafe {
        libc::strncpy(dst as *mut c_char, src as *const c_char, n as usize);
    }
    call.record_write(dst, n)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn strcat(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src) = (args[0] as u32, args[1], args[2]);
    let Some(dst_len) = call.check_c_string(0, dst)? else { return Ok(None) };
    let Some(src_len) = call.check_c_string(1, src)? else { return Ok(None) };
    if !call.check_write(0, dst + dst_len, src_len + 1)? {
        return Ok(None);
    }
    unsafe {
        libc::strcat(dst as *mut c_char, src as *const c_char);
    }
    call.record_write(dst + dst_len, src_len + 1)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn strncat(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, dst, src, n) = (args[0] as u32, args[1], args[2], args[3]);
    let Some(dst_len) = call.check_c_string(0, dst)? else { return Ok(None) };
    let Some(copy_len) = call.check_limited_c_string(1, src, n)? else { return Ok(None) };
    let copy_len = copy_len.min(n);
    if !call.check_write(0, dst + dst_len, copy_len + 1)? {
        return Ok(None);
    }
    unsafe {
        libc::strncat(dst as *mut c_char, src as *const c_char, n as usize);
    }
    call.record_write(dst + dst_len, copy_len + 1)?;
    call.listener.notify_value_ptr(instr, dst, call.tag_for(dst))?;
    Ok(Some(dst))
}

pub fn strcmp(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, a, b) = (args[0] as u32, args[1], args[2]);
    if call.check_c_string(0, a)?.is_none() || call.check_c_string(1, b)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::strcmp(a as *const c_char, b as *const c_char) };
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}

pub fn strncmp(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, a, b, n) = (args[0] as u32, args[1], args[2], args[3]);
    if call.check_limited_c_string(0, a, n)?.is_none() || call.check_limited_c_string(1, b, n)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::strncmp(a as *const c_char, b as *const c_char, n as usize) };
    call.listener.notify_value_int(instr, result as i64 as u64)?;
    Ok(Some(result as i64 as u64))
}

pub fn strchr(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, s, c) = (args[0] as u32, args[1], args[2] as c_int);
    if call.check_c_string(0, s)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::strchr(s as *const c_char, c) } as u64;
    call.listener.notify_value_ptr(instr, result, call.tag_for(result))?;
    Ok(Some(result))
}

pub fn strstr(mut call: ShimCall<'_, '_>, args: RawArgs) -> io::Result<RawResult> {
    let (instr, haystack, needle) = (args[0] as u32, args[1], args[2]);
    if call.check_c_string(0, haystack)?.is_none() || call.check_c_string(1, needle)?.is_none() {
        return Ok(None);
    }
    let result = unsafe { libc::strstr(haystack as *const c_char, needle as *const c_char) } as u64;
    call.listener.notify_value_ptr(instr, result, call.tag_for(result))?;
    Ok(Some(result))
}
